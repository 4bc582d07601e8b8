//! Channel uplink gateway
//!
//! Forwards a live channel byte stream from a local tuner to a remote
//! media ingestion endpoint: resolve the stream's data-plane endpoint,
//! open the channel stream, feed it into a long-lived upload, and track
//! per-fragment acknowledgments as they come back. At most one session
//! is live at a time; switching channels is a stop-then-start.

pub mod ack;
pub mod api;
pub mod config;
pub mod endpoint;
pub mod metrics;
pub mod session;
pub mod source;
pub mod transport;

pub use config::{Config, StreamIdentity};
pub use session::{ReleaseWarning, SessionController, SessionStatus, UplinkError};
pub use transport::{AckEvent, TransportEvent};
