//! Upload transport contract
//!
//! The session controller hands an open byte source to a transport, which
//! owns the long-lived upload and reports back with a typed event sequence:
//! per-fragment acknowledgments, a terminal failure, or an orderly
//! completion. `HttpMediaTransport` implements the ingestion service's
//! wire behavior: one streaming POST per session whose response body is a
//! newline-delimited sequence of JSON acknowledgment records.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::source::SourceBody;

/// A single fragment acknowledgment from the ingestion endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckEvent {
    /// Fragment timecode reported by the endpoint
    pub fragment_timecode: u64,

    /// Fragment number reported by the endpoint
    pub fragment_number: u64,

    /// Payload bytes handed to the transport when this ack arrived
    pub acknowledged_bytes: u64,
}

/// Events delivered by a transport over the life of one upload
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A fragment was acknowledged
    Ack(AckEvent),

    /// The upload broke; terminal for the session
    Failure(String),

    /// The upload ended in order (source exhausted)
    Complete,
}

/// How fragment timecodes relate to the producer timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentTimecodeType {
    Relative,
    Absolute,
}

impl FragmentTimecodeType {
    /// Wire value sent to the ingestion endpoint
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentTimecodeType::Relative => "RELATIVE",
            FragmentTimecodeType::Absolute => "ABSOLUTE",
        }
    }
}

impl std::fmt::Display for FragmentTimecodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for opening an upload
#[derive(Debug, Clone)]
pub struct UplinkRequest {
    /// Remote stream name
    pub stream_name: String,

    /// Resolved data-plane endpoint
    pub endpoint: Url,

    /// Timecode interpretation for this upload
    pub fragment_timecode_type: FragmentTimecodeType,

    /// Producer-side session start timestamp
    pub producer_start: DateTime<Utc>,
}

/// Handle on an open upload, kept by the session for release
#[async_trait]
pub trait UplinkHandle: Send {
    /// Flush/abort the upload and release the connection
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}

/// Upload transport contract
///
/// The transport consumes the byte source on its own task and delivers
/// `TransportEvent`s on the returned channel until `Failure` or `Complete`.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn open_uplink(
        &self,
        request: UplinkRequest,
        payload: SourceBody,
    ) -> Result<(Box<dyn UplinkHandle>, mpsc::Receiver<TransportEvent>), TransportError>;
}

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid data-plane endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Failed to build transport client: {0}")]
    Client(String),

    #[error("Failed to close uplink: {0}")]
    Close(String),
}

/// One acknowledgment record on the upload response body
#[derive(Debug, Deserialize)]
struct AckRecord {
    #[serde(rename = "EventType")]
    event_type: String,

    #[serde(rename = "FragmentTimecode")]
    fragment_timecode: Option<u64>,

    #[serde(rename = "FragmentNumber")]
    fragment_number: Option<String>,

    #[serde(rename = "ErrorId")]
    error_id: Option<u64>,
}

/// HTTP upload transport
///
/// Opens a streaming POST against `<endpoint>/putMedia`, wrapping the
/// channel byte stream as the request body and reading acknowledgment
/// records off the response body until it ends.
pub struct HttpMediaTransport {
    client: reqwest::Client,
    event_capacity: usize,
}

impl HttpMediaTransport {
    /// Create a transport with the default event channel capacity
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            event_capacity: 64,
        })
    }
}

#[async_trait]
impl MediaTransport for HttpMediaTransport {
    async fn open_uplink(
        &self,
        request: UplinkRequest,
        payload: SourceBody,
    ) -> Result<(Box<dyn UplinkHandle>, mpsc::Receiver<TransportEvent>), TransportError> {
        let put_url = request
            .endpoint
            .join("putMedia")
            .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(self.event_capacity);

        // Count payload bytes on the way out so acks can report progress
        let sent_bytes = Arc::new(AtomicU64::new(0));
        let counted = {
            let sent_bytes = sent_bytes.clone();
            payload.inspect(move |chunk| {
                if let Ok(chunk) = chunk {
                    sent_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
            })
        };

        let upload = self
            .client
            .post(put_url)
            .header("x-amzn-stream-name", request.stream_name.clone())
            .header(
                "x-amzn-fragment-timecode-type",
                request.fragment_timecode_type.as_str(),
            )
            .header(
                "x-amzn-producer-start-timestamp",
                producer_timestamp(request.producer_start),
            )
            .body(reqwest::Body::wrap_stream(counted));

        let stream_name = request.stream_name;
        let task = tokio::spawn(async move {
            run_upload(upload, stream_name, sent_bytes, event_tx).await;
        });

        Ok((Box::new(HttpUplinkHandle { task }), event_rx))
    }
}

/// Drive one upload to its terminal event
async fn run_upload(
    upload: reqwest::RequestBuilder,
    stream_name: String,
    sent_bytes: Arc<AtomicU64>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let response = match upload.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = event_tx.send(TransportEvent::Failure(e.to_string())).await;
            return;
        }
    };

    if !response.status().is_success() {
        let _ = event_tx
            .send(TransportEvent::Failure(format!(
                "uplink rejected with status {}",
                response.status()
            )))
            .await;
        return;
    }

    tracing::info!(stream_name = %stream_name, "Uplink established");

    let mut acks = response.bytes_stream();
    let mut buffer = BytesMut::new();

    while let Some(chunk) = acks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = event_tx.send(TransportEvent::Failure(e.to_string())).await;
                return;
            }
        };

        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line = buffer.split_to(pos + 1);
            if let Some(event) = parse_ack_line(&line[..pos], sent_bytes.load(Ordering::Relaxed)) {
                let failed = matches!(event, TransportEvent::Failure(_));
                if event_tx.send(event).await.is_err() {
                    return;
                }
                if failed {
                    return;
                }
            }
        }
    }

    // Response body may end without a trailing newline
    if !buffer.is_empty() {
        if let Some(event) = parse_ack_line(&buffer, sent_bytes.load(Ordering::Relaxed)) {
            if event_tx.send(event).await.is_err() {
                return;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Complete).await;
}

/// Parse one acknowledgment line into a transport event
fn parse_ack_line(line: &[u8], acknowledged_bytes: u64) -> Option<TransportEvent> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }

    let record: AckRecord = match serde_json::from_str(line) {
        Ok(record) => record,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable acknowledgment line");
            return None;
        }
    };

    if record.event_type.eq_ignore_ascii_case("ERROR") {
        let detail = match record.error_id {
            Some(id) => format!("acknowledgment error {}", id),
            None => "acknowledgment error".to_string(),
        };
        return Some(TransportEvent::Failure(detail));
    }

    Some(TransportEvent::Ack(AckEvent {
        fragment_timecode: record.fragment_timecode.unwrap_or(0),
        fragment_number: record
            .fragment_number
            .and_then(|n| n.parse().ok())
            .unwrap_or(0),
        acknowledged_bytes,
    }))
}

/// Epoch timestamp in the `seconds.millis` form the endpoint expects
fn producer_timestamp(at: DateTime<Utc>) -> String {
    format!("{:.3}", at.timestamp_millis() as f64 / 1000.0)
}

/// Handle over the spawned upload task
struct HttpUplinkHandle {
    task: JoinHandle<()>,
}

#[async_trait]
impl UplinkHandle for HttpUplinkHandle {
    async fn close(self: Box<Self>) -> Result<(), TransportError> {
        self.task.abort();
        match self.task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TransportError::Close(e.to_string())),
        }
    }
}
