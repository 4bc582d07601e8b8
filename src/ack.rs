//! Acknowledgment tracking
//!
//! Each session binds exactly one tracker to the transport's event
//! sequence. The tracker runs on its own task but applies every update
//! through the session lock, so a failure arriving mid-teardown can never
//! race the controller's own writes. A generation stamp taken at bind
//! time makes events that arrive after the session was released get
//! ignored rather than raise, since they may race with a teardown
//! initiated for an unrelated reason.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::metrics;
use crate::session::{SessionInner, SessionStatus, UplinkError};
use crate::transport::TransportEvent;

/// Consumes one session's transport event sequence
pub struct AckTracker;

impl AckTracker {
    /// Spawn the tracker task bound to one session generation
    pub(crate) fn spawn(
        session: Arc<Mutex<SessionInner>>,
        generation: u64,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let mut session = session.lock().await;

                if session.generation != generation {
                    tracing::debug!("Ignoring transport event for a released session");
                    break;
                }

                match event {
                    TransportEvent::Ack(ack) => {
                        tracing::debug!(
                            fragment_number = ack.fragment_number,
                            fragment_timecode = ack.fragment_timecode,
                            acknowledged_bytes = ack.acknowledged_bytes,
                            "Fragment acknowledged"
                        );
                        metrics::global_metrics().ack_received(ack.acknowledged_bytes);
                        session.last_ack = Some(ack);
                    }
                    TransportEvent::Failure(cause) => {
                        tracing::error!(
                            session_id = ?session.session_id,
                            channel_id = ?session.channel_id,
                            cause = %cause,
                            "Transport failure, session failed"
                        );
                        metrics::global_metrics().transport_failure();
                        session.status = SessionStatus::Failed;
                        session.last_error = Some(UplinkError::Transport(cause));
                        // Terminal: handles stay for the next stop or start
                        break;
                    }
                    TransportEvent::Complete => {
                        tracing::info!(
                            session_id = ?session.session_id,
                            channel_id = ?session.channel_id,
                            "Transport completed, releasing session"
                        );
                        metrics::global_metrics().session_completed();
                        session.status = SessionStatus::Stopping;
                        session.generation = session.generation.wrapping_add(1);
                        // Our own handle; must drop, not abort
                        drop(session.ack_task.take());

                        let warnings = session.release_handles().await;
                        for warning in &warnings {
                            tracing::warn!(
                                handle = warning.handle,
                                cause = %warning.cause,
                                "Handle release failed during completion"
                            );
                        }
                        session.status = SessionStatus::Idle;
                        break;
                    }
                }
            }
        })
    }
}
