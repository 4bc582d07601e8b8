//! Local media source access
//!
//! Opens the tuner's per-channel HTTP stream and hands it over as an
//! abortable byte sequence. One attempt per call; retry and backoff
//! policy stay with the session controller.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use url::Url;

/// Contract for opening a channel byte stream
#[async_trait]
pub trait SourceOpener: Send + Sync {
    /// Open a readable byte sequence for a channel; a single attempt
    async fn open(&self, channel_id: &str) -> Result<MediaSource, OpenError>;
}

/// An open channel stream, split into the readable body and the
/// release handle the session keeps.
pub struct MediaSource {
    body: SourceBody,
    handle: Box<dyn SourceHandle>,
}

impl MediaSource {
    /// Wrap an arbitrary byte stream in an abortable source
    ///
    /// Closing (or dropping) the returned handle makes the next read on
    /// the body fail promptly with a `ConnectionAborted` error instead of
    /// blocking on the upstream.
    pub fn from_stream<S>(upstream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let guarded = async_stream::stream! {
            let mut upstream = Box::pin(upstream);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        let released = changed.is_err() || *shutdown_rx.borrow();
                        if released {
                            yield Err(std::io::Error::new(
                                std::io::ErrorKind::ConnectionAborted,
                                "source handle released",
                            ));
                            break;
                        }
                    }
                    chunk = upstream.next() => match chunk {
                        Some(chunk) => yield chunk,
                        None => break,
                    },
                }
            }
        };

        Self {
            body: SourceBody {
                inner: Box::pin(guarded),
            },
            handle: Box::new(StreamAbortHandle {
                shutdown: shutdown_tx,
            }),
        }
    }

    /// Build a source from pre-split parts (used by custom openers)
    pub fn from_parts(body: SourceBody, handle: Box<dyn SourceHandle>) -> Self {
        Self { body, handle }
    }

    /// Split into the body handed to the transport and the handle the
    /// session keeps for release.
    pub fn split(self) -> (SourceBody, Box<dyn SourceHandle>) {
        (self.body, self.handle)
    }
}

/// Readable half of an open channel stream
pub struct SourceBody {
    inner: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
}

impl SourceBody {
    /// Box an arbitrary byte stream as a body
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for SourceBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Release handle for an open channel stream
pub trait SourceHandle: Send {
    /// Close the stream; idempotent, and any in-flight read fails promptly
    fn close(&mut self) -> std::io::Result<()>;
}

/// Watch-backed abort handle produced by `MediaSource::from_stream`
struct StreamAbortHandle {
    shutdown: watch::Sender<bool>,
}

impl SourceHandle for StreamAbortHandle {
    fn close(&mut self) -> std::io::Result<()> {
        // Receiver may already be gone when the body finished first
        let _ = self.shutdown.send(true);
        Ok(())
    }
}

/// Source open errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum OpenError {
    #[error("Invalid source address {address}: {cause}")]
    InvalidAddress { address: String, cause: String },

    #[error("Failed to build source client: {0}")]
    Client(String),

    #[error("Failed to connect to source: {0}")]
    Connect(String),

    #[error("Source open timed out after {millis} ms")]
    Timeout { millis: u64 },

    #[error("Source answered with status {0}")]
    Status(u16),
}

/// HTTP source opener for tuner-style per-channel streams
///
/// The stream address is the configured base address with the channel id
/// appended, e.g. `http://127.0.0.1:9981/stream/channel/5`.
pub struct HttpSourceOpener {
    base_url: String,
    connect_timeout: Duration,
    client: reqwest::Client,
}

impl HttpSourceOpener {
    /// Create an opener for the given base address and connect timeout
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration) -> Result<Self, OpenError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| OpenError::Client(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            connect_timeout,
            client,
        })
    }

    fn channel_url(&self, channel_id: &str) -> Result<Url, OpenError> {
        let raw = format!("{}/{}", self.base_url, channel_id);
        Url::parse(&raw).map_err(|e| OpenError::InvalidAddress {
            address: raw,
            cause: e.to_string(),
        })
    }
}

#[async_trait]
impl SourceOpener for HttpSourceOpener {
    async fn open(&self, channel_id: &str) -> Result<MediaSource, OpenError> {
        let url = self.channel_url(channel_id)?;

        tracing::info!(channel_id = %channel_id, url = %url, "Opening channel stream");

        let response = tokio::time::timeout(self.connect_timeout, self.client.get(url).send())
            .await
            .map_err(|_| OpenError::Timeout {
                millis: self.connect_timeout.as_millis() as u64,
            })?
            .map_err(|e| OpenError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OpenError::Status(response.status().as_u16()));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));

        Ok(MediaSource::from_stream(stream))
    }
}
