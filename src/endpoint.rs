//! Data-plane endpoint resolution
//!
//! Before any media can be uploaded, the ingestion service's control plane
//! must be asked which data-plane host accepts the upload for a given
//! stream. The answer is stable for the life of the process, so it is
//! resolved once per stream name and cached.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use url::Url;

/// A resolved data-plane endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Upload URL for the stream
    pub url: Url,

    /// When the lookup succeeded
    pub resolved_at: DateTime<Utc>,
}

/// Control-plane lookup contract
///
/// One call per resolution; the resolver owns caching and the caller owns
/// retry policy.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Return the data-plane endpoint URL for a stream name
    async fn describe_data_endpoint(&self, stream_name: &str) -> Result<String, ResolveError>;
}

/// Caching endpoint resolver
///
/// The first `resolve` for a stream name queries the control plane;
/// later calls return the cached endpoint without a query. The cache is
/// only dropped through `invalidate`.
pub struct EndpointResolver {
    control: Arc<dyn ControlPlane>,
    cache: RwLock<HashMap<String, Endpoint>>,
}

impl EndpointResolver {
    /// Create a resolver backed by the given control plane
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self {
            control,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the data-plane endpoint for a stream name
    pub async fn resolve(&self, stream_name: &str) -> Result<Endpoint, ResolveError> {
        if let Some(endpoint) = self.cache.read().await.get(stream_name) {
            return Ok(endpoint.clone());
        }

        let raw = self.control.describe_data_endpoint(stream_name).await?;
        if raw.trim().is_empty() {
            return Err(ResolveError::EmptyEndpoint {
                stream_name: stream_name.to_string(),
            });
        }

        let url = Url::parse(&raw).map_err(|e| ResolveError::InvalidEndpoint {
            stream_name: stream_name.to_string(),
            cause: e.to_string(),
        })?;

        let endpoint = Endpoint {
            url,
            resolved_at: Utc::now(),
        };

        tracing::info!(
            stream_name = %stream_name,
            endpoint = %endpoint.url,
            "Resolved data-plane endpoint"
        );

        self.cache
            .write()
            .await
            .insert(stream_name.to_string(), endpoint.clone());

        Ok(endpoint)
    }

    /// Drop a cached endpoint so the next `resolve` queries again
    pub async fn invalidate(&self, stream_name: &str) {
        self.cache.write().await.remove(stream_name);
    }
}

/// Endpoint resolution errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Control-plane lookup failed: {0}")]
    ControlPlane(String),

    #[error("Control plane returned an empty endpoint for stream {stream_name}")]
    EmptyEndpoint { stream_name: String },

    #[error("Control plane returned an invalid endpoint for stream {stream_name}: {cause}")]
    InvalidEndpoint { stream_name: String, cause: String },
}

/// Request body for the control-plane lookup
#[derive(Debug, Serialize)]
struct DescribeEndpointRequest<'a> {
    #[serde(rename = "StreamName")]
    stream_name: &'a str,

    #[serde(rename = "APIName")]
    api_name: &'a str,
}

/// Response body of the control-plane lookup
#[derive(Debug, Deserialize)]
struct DescribeEndpointResponse {
    #[serde(rename = "DataEndpoint")]
    data_endpoint: String,
}

/// HTTP control-plane client
///
/// Speaks the ingestion service's JSON lookup: a POST naming the stream
/// and the upload API, answered with the data-plane endpoint URL.
pub struct HttpControlPlane {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpControlPlane {
    /// Create a client against the given control-plane base URL
    pub fn new(endpoint: &str) -> Result<Self, ResolveError> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            ResolveError::ControlPlane(format!("invalid control endpoint {}: {}", endpoint, e))
        })?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ResolveError::ControlPlane(e.to_string()))?;

        Ok(Self { endpoint, client })
    }

    fn lookup_url(&self) -> Result<Url, ResolveError> {
        self.endpoint
            .join("getDataEndpoint")
            .map_err(|e| ResolveError::ControlPlane(e.to_string()))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn describe_data_endpoint(&self, stream_name: &str) -> Result<String, ResolveError> {
        let request = DescribeEndpointRequest {
            stream_name,
            api_name: "PUT_MEDIA",
        };

        let response = self
            .client
            .post(self.lookup_url()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| ResolveError::ControlPlane(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::ControlPlane(format!(
                "lookup returned status {}",
                response.status()
            )));
        }

        let body: DescribeEndpointResponse = response
            .json()
            .await
            .map_err(|e| ResolveError::ControlPlane(e.to_string()))?;

        Ok(body.data_endpoint)
    }
}
