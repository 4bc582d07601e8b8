//! Metrics collection for the uplink gateway
//!
//! Process-lifetime counters for monitoring session churn and upload
//! progress.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Gateway metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Start attempts since startup
    starts_attempted: AtomicU64,

    /// Start attempts that ended in a failed session
    starts_failed: AtomicU64,

    /// Sessions torn down by an operator stop
    sessions_stopped: AtomicU64,

    /// Sessions that ended with an orderly transport completion
    sessions_completed: AtomicU64,

    /// Transport failures observed on active sessions
    transport_failures: AtomicU64,

    /// Acknowledgments received since startup
    acks_received: AtomicU64,

    /// Payload bytes acknowledged on the most recent ack
    bytes_acknowledged: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    /// Record a start attempt
    pub fn start_attempted(&self) {
        self.starts_attempted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a start attempt ending in a failed session
    pub fn start_failed(&self) {
        self.starts_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an operator stop tearing a session down
    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an orderly transport completion
    pub fn session_completed(&self) {
        self.sessions_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transport failure
    pub fn transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a received acknowledgment
    pub fn ack_received(&self, acknowledged_bytes: u64) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_acknowledged
            .store(acknowledged_bytes, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let uptime_secs = now.saturating_sub(self.startup_time.load(Ordering::Relaxed));

        MetricsSnapshot {
            starts_attempted: self.starts_attempted.load(Ordering::Relaxed),
            starts_failed: self.starts_failed.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            sessions_completed: self.sessions_completed.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            bytes_acknowledged: self.bytes_acknowledged.load(Ordering::Relaxed),
            uptime_secs,
        }
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Start attempts since startup
    pub starts_attempted: u64,

    /// Start attempts that ended failed
    pub starts_failed: u64,

    /// Sessions torn down by operator stop
    pub sessions_stopped: u64,

    /// Sessions ended by orderly completion
    pub sessions_completed: u64,

    /// Transport failures observed
    pub transport_failures: u64,

    /// Acknowledgments received
    pub acks_received: u64,

    /// Bytes acknowledged on the latest ack
    pub bytes_acknowledged: u64,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Fraction of start attempts that succeeded
    pub fn start_success_rate(&self) -> f64 {
        if self.starts_attempted == 0 {
            1.0
        } else {
            1.0 - self.starts_failed as f64 / self.starts_attempted as f64
        }
    }

    /// Acknowledgments per second since startup
    pub fn acks_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.acks_received as f64 / self.uptime_secs as f64
        }
    }
}

/// Global metrics instance
static GLOBAL_METRICS: std::sync::OnceLock<Arc<Metrics>> = std::sync::OnceLock::new();

/// Get the global metrics instance
pub fn global_metrics() -> Arc<Metrics> {
    GLOBAL_METRICS
        .get_or_init(|| Arc::new(Metrics::new()))
        .clone()
}
