//! Gateway configuration
//!
//! Loads settings from a TOML file with environment variable overrides
//! for the common knobs. Every section has working defaults so the
//! gateway can start without a config file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of the remote stream this gateway uploads to
///
/// Built once from configuration and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    /// Remote stream name
    pub stream_name: String,

    /// Region the stream lives in
    pub region: String,
}

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Remote stream identity
    pub stream: StreamConfig,

    /// Local media source settings
    pub source: SourceConfig,

    /// Control-plane lookup settings
    pub control: ControlConfig,

    /// Operator HTTP server settings
    pub server: ServerConfig,
}

/// Remote stream section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream name at the ingestion service
    pub name: String,

    /// Service region
    pub region: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: "south1".to_string(),
            region: "eu-west-1".to_string(),
        }
    }
}

/// Local media source section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base address of the tuner; the channel id is appended per session
    pub base_url: String,

    /// Bounded connection timeout for opening a channel stream
    pub connect_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9981/stream/channel".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl SourceConfig {
    /// Connection timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Control-plane section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Control-plane endpoint answering data-endpoint lookups
    pub endpoint: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8085".to_string(),
        }
    }
}

/// Operator HTTP server section
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host for the operator API
    pub bind: String,

    /// Bind port for the operator API
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            http_port: 8080,
        }
    }
}

impl ServerConfig {
    /// Full bind address for the operator API
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.http_port)
    }
}

impl Config {
    /// Load configuration from the `UPLINK_CONFIG` file if set, then apply
    /// environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("UPLINK_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().display().to_string(),
            cause: e.to_string(),
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.as_ref().display().to_string(),
            cause: e.to_string(),
        })
    }

    /// Apply single-value environment overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("UPLINK_STREAM_NAME") {
            self.stream.name = name;
        }
        if let Ok(base_url) = std::env::var("UPLINK_SOURCE_BASE_URL") {
            self.source.base_url = base_url;
        }
        if let Ok(endpoint) = std::env::var("UPLINK_CONTROL_ENDPOINT") {
            self.control.endpoint = endpoint;
        }
        if let Ok(port) = std::env::var("UPLINK_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                self.server.http_port = port;
            }
        }
    }

    /// Identity of the configured remote stream
    pub fn stream_identity(&self) -> StreamIdentity {
        StreamIdentity {
            stream_name: self.stream.name.clone(),
            region: self.stream.region.clone(),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {cause}")]
    Read { path: String, cause: String },

    #[error("Failed to parse config file {path}: {cause}")]
    Parse { path: String, cause: String },
}
