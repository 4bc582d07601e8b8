//! Uplink session lifecycle
//!
//! One controller owns at most one live session: the open channel stream,
//! the upload it feeds, and the session's observable state. Every
//! transition (operator start/stop, channel switches, transport failure,
//! orderly completion) serializes through a single lock on the session
//! aggregate, so there is never a window where two sessions hold the
//! producer timeline at once.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ack::AckTracker;
use crate::config::StreamIdentity;
use crate::endpoint::{EndpointResolver, ResolveError};
use crate::metrics;
use crate::source::{OpenError, SourceHandle, SourceOpener};
use crate::transport::{
    AckEvent, FragmentTimecodeType, MediaTransport, UplinkHandle, UplinkRequest,
};

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No session; both handles released
    Idle,

    /// A start attempt is in flight
    Starting,

    /// Media is being forwarded and acknowledgments consumed
    Active,

    /// Teardown in progress
    Stopping,

    /// The last start attempt or active upload broke; handles (if any)
    /// are released by the next stop or start
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::Active => "active",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why a session attempt or an active session failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum UplinkError {
    #[error("Failed to open channel {channel}: {cause}")]
    Open {
        channel: String,
        #[source]
        cause: OpenError,
    },

    #[error("Endpoint resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Transport failure: {0}")]
    Transport(String),
}

/// A handle that did not close cleanly during teardown
///
/// Non-fatal: the other handle is still released and the session still
/// reaches `Idle`.
#[derive(Debug, Clone)]
pub struct ReleaseWarning {
    /// Which handle failed to close
    pub handle: &'static str,

    /// Underlying cause
    pub cause: String,
}

impl ReleaseWarning {
    fn new(handle: &'static str, cause: String) -> Self {
        Self { handle, cause }
    }
}

impl std::fmt::Display for ReleaseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} handle did not close cleanly: {}", self.handle, self.cause)
    }
}

/// The mutable session aggregate
///
/// Only ever touched while holding the controller's lock; the ack tracker
/// goes through the same lock.
pub(crate) struct SessionInner {
    pub(crate) status: SessionStatus,
    pub(crate) session_id: Option<String>,
    pub(crate) channel_id: Option<String>,
    pub(crate) source: Option<Box<dyn SourceHandle>>,
    pub(crate) uplink: Option<Box<dyn UplinkHandle>>,
    pub(crate) ack_task: Option<JoinHandle<()>>,
    pub(crate) last_ack: Option<AckEvent>,
    pub(crate) last_error: Option<UplinkError>,

    /// Bumped on every bind and release; transport events stamped with an
    /// older generation are ignored instead of raising
    pub(crate) generation: u64,
}

impl SessionInner {
    pub(crate) fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: None,
            channel_id: None,
            source: None,
            uplink: None,
            ack_task: None,
            last_ack: None,
            last_error: None,
            generation: 0,
        }
    }

    /// Release both handles: transport first so no further bytes are read
    /// from a source about to be discarded, then the source. Both are
    /// attempted even if one fails.
    pub(crate) async fn release_handles(&mut self) -> Vec<ReleaseWarning> {
        let mut warnings = Vec::new();

        if let Some(uplink) = self.uplink.take() {
            if let Err(e) = uplink.close().await {
                warnings.push(ReleaseWarning::new("transport", e.to_string()));
            }
        }

        if let Some(mut source) = self.source.take() {
            if let Err(e) = source.close() {
                warnings.push(ReleaseWarning::new("source", e.to_string()));
            }
        }

        self.session_id = None;
        self.channel_id = None;
        warnings
    }
}

/// Generate a short unique session id for logs and status reports
fn new_session_id() -> String {
    let id = uuid::Uuid::new_v4().to_string().replace('-', "");
    format!("up_{}", &id[..12])
}

/// Full teardown of whatever the session currently holds
async fn teardown(session: &mut SessionInner) -> Vec<ReleaseWarning> {
    session.status = SessionStatus::Stopping;
    session.generation = session.generation.wrapping_add(1);

    if let Some(task) = session.ack_task.take() {
        task.abort();
    }

    let warnings = session.release_handles().await;
    session.status = SessionStatus::Idle;
    warnings
}

fn log_release_warnings(warnings: &[ReleaseWarning]) {
    for warning in warnings {
        tracing::warn!(handle = warning.handle, cause = %warning.cause, "Handle release failed");
    }
}

/// Record a failed start attempt on the session
fn fail(session: &mut SessionInner, error: UplinkError) -> SessionStatus {
    tracing::error!(
        channel_id = ?session.channel_id,
        error = %error,
        "Start attempt failed"
    );
    metrics::global_metrics().start_failed();
    session.status = SessionStatus::Failed;
    session.last_error = Some(error);
    SessionStatus::Failed
}

/// Session lifecycle controller
///
/// Owns the single session aggregate and orchestrates stop-then-start
/// transitions against the three collaborators: source opener, endpoint
/// resolver, and upload transport.
pub struct SessionController {
    stream: StreamIdentity,
    resolver: Arc<EndpointResolver>,
    opener: Arc<dyn SourceOpener>,
    transport: Arc<dyn MediaTransport>,
    session: Arc<Mutex<SessionInner>>,
}

impl SessionController {
    /// Create a controller for one remote stream
    pub fn new(
        stream: StreamIdentity,
        resolver: Arc<EndpointResolver>,
        opener: Arc<dyn SourceOpener>,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        Self {
            stream,
            resolver,
            opener,
            transport,
            session: Arc::new(Mutex::new(SessionInner::new())),
        }
    }

    /// Start forwarding a channel
    ///
    /// Any live session is torn down first, so switching channels is
    /// exactly: implicit stop, then start. Failures are captured on the
    /// session (`Failed` + `last_error`) rather than returned, so callers
    /// poll status uniformly regardless of which phase broke.
    pub async fn start(&self, channel_id: &str) -> SessionStatus {
        let mut session = self.session.lock().await;

        if session.status != SessionStatus::Idle {
            let warnings = teardown(&mut session).await;
            log_release_warnings(&warnings);
        }

        metrics::global_metrics().start_attempted();
        let session_id = new_session_id();
        session.status = SessionStatus::Starting;
        session.session_id = Some(session_id.clone());
        session.channel_id = Some(channel_id.to_string());
        session.last_error = None;
        session.last_ack = None;

        tracing::info!(
            session_id = %session_id,
            channel_id = %channel_id,
            stream_name = %self.stream.stream_name,
            "Starting uplink session"
        );

        let source = match self.opener.open(channel_id).await {
            Ok(source) => source,
            Err(cause) => {
                // No transport handle was ever created; nothing to release
                return fail(
                    &mut session,
                    UplinkError::Open {
                        channel: channel_id.to_string(),
                        cause,
                    },
                );
            }
        };

        let endpoint = match self.resolver.resolve(&self.stream.stream_name).await {
            Ok(endpoint) => endpoint,
            Err(cause) => {
                let (_, mut source_handle) = source.split();
                if let Err(e) = source_handle.close() {
                    tracing::warn!(cause = %e, "Source release failed after resolution error");
                }
                return fail(&mut session, UplinkError::Resolve(cause));
            }
        };

        let (body, source_handle) = source.split();
        let request = UplinkRequest {
            stream_name: self.stream.stream_name.clone(),
            endpoint: endpoint.url,
            fragment_timecode_type: FragmentTimecodeType::Relative,
            producer_start: Utc::now(),
        };

        match self.transport.open_uplink(request, body).await {
            Ok((uplink, events)) => {
                session.generation = session.generation.wrapping_add(1);
                session.source = Some(source_handle);
                session.uplink = Some(uplink);
                session.ack_task = Some(AckTracker::spawn(
                    self.session.clone(),
                    session.generation,
                    events,
                ));
                session.status = SessionStatus::Active;

                tracing::info!(session_id = %session_id, channel_id = %channel_id, "Uplink session active");
                SessionStatus::Active
            }
            Err(cause) => {
                let mut source_handle = source_handle;
                if let Err(e) = source_handle.close() {
                    tracing::warn!(cause = %e, "Source release failed after transport error");
                }
                fail(&mut session, UplinkError::Transport(cause.to_string()))
            }
        }
    }

    /// Tear the current session down
    ///
    /// Idempotent: a no-op on `Idle`. Release failures are aggregated as
    /// warnings and never block the `Idle` transition.
    pub async fn stop(&self) -> Vec<ReleaseWarning> {
        let mut session = self.session.lock().await;

        if session.status == SessionStatus::Idle {
            return Vec::new();
        }

        tracing::info!(
            session_id = ?session.session_id,
            channel_id = ?session.channel_id,
            "Stopping uplink session"
        );
        metrics::global_metrics().session_stopped();

        let warnings = teardown(&mut session).await;
        log_release_warnings(&warnings);
        warnings
    }

    /// Current session status
    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status
    }

    /// Id of the current session, if any
    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.session_id.clone()
    }

    /// Channel the current session is forwarding, if any
    pub async fn current_channel(&self) -> Option<String> {
        self.session.lock().await.channel_id.clone()
    }

    /// Most recent acknowledgment observed on the current session
    pub async fn last_ack_event(&self) -> Option<AckEvent> {
        self.session.lock().await.last_ack.clone()
    }

    /// Most recent failure recorded on the session
    pub async fn last_error(&self) -> Option<UplinkError> {
        self.session.lock().await.last_error.clone()
    }

    /// Identity of the remote stream this controller uploads to
    pub fn stream_identity(&self) -> &StreamIdentity {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingSourceHandle {
        log: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    impl SourceHandle for RecordingSourceHandle {
        fn close(&mut self) -> std::io::Result<()> {
            self.log.lock().unwrap().push("close:source".to_string());
            if self.fail {
                Err(std::io::Error::new(std::io::ErrorKind::Other, "stuck socket"))
            } else {
                Ok(())
            }
        }
    }

    struct RecordingUplinkHandle {
        log: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl UplinkHandle for RecordingUplinkHandle {
        async fn close(self: Box<Self>) -> Result<(), TransportError> {
            self.log.lock().unwrap().push("close:transport".to_string());
            if self.fail {
                Err(TransportError::Close("flush failed".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn session_with_handles(
        log: Arc<StdMutex<Vec<String>>>,
        fail_transport: bool,
        fail_source: bool,
    ) -> SessionInner {
        let mut session = SessionInner::new();
        session.status = SessionStatus::Active;
        session.channel_id = Some("5".to_string());
        session.source = Some(Box::new(RecordingSourceHandle {
            log: log.clone(),
            fail: fail_source,
        }));
        session.uplink = Some(Box::new(RecordingUplinkHandle {
            log,
            fail: fail_transport,
        }));
        session
    }

    #[tokio::test]
    async fn test_release_closes_transport_before_source() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut session = session_with_handles(log.clone(), false, false);

        let warnings = session.release_handles().await;

        assert!(warnings.is_empty());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["close:transport".to_string(), "close:source".to_string()]
        );
        assert!(session.channel_id.is_none());
        assert!(session.source.is_none());
        assert!(session.uplink.is_none());
    }

    #[tokio::test]
    async fn test_release_attempts_both_handles_and_aggregates_warnings() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut session = session_with_handles(log.clone(), true, true);

        let warnings = session.release_handles().await;

        // A failing transport close must not prevent the source release
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].handle, "transport");
        assert_eq!(warnings[1].handle, "source");
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_teardown_reaches_idle_even_with_release_failures() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let mut session = session_with_handles(log, true, true);
        let generation_before = session.generation;

        let warnings = teardown(&mut session).await;

        assert_eq!(warnings.len(), 2);
        assert_eq!(session.status, SessionStatus::Idle);
        assert_ne!(session.generation, generation_before);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SessionStatus::Idle.to_string(), "idle");
        assert_eq!(SessionStatus::Active.to_string(), "active");
        assert_eq!(SessionStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_release_warning_display() {
        let warning = ReleaseWarning::new("transport", "flush failed".to_string());
        assert_eq!(
            warning.to_string(),
            "transport handle did not close cleanly: flush failed"
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::Starting).unwrap(),
            "\"starting\""
        );
    }
}
