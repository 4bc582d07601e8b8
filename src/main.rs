//! Gateway binary entry point
//!
//! Starts the channel uplink gateway with its operator HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (tuner on localhost:9981, API on localhost:8080)
//! cargo run
//!
//! # Start with a config file
//! UPLINK_CONFIG=uplink.toml cargo run
//!
//! # With logging
//! RUST_LOG=debug cargo run
//! ```
//!
//! # Environment Variables
//!
//! - `UPLINK_CONFIG`: Path to a TOML config file
//! - `UPLINK_STREAM_NAME`: Remote stream name override
//! - `UPLINK_SOURCE_BASE_URL`: Tuner base address override
//! - `UPLINK_CONTROL_ENDPOINT`: Control-plane endpoint override
//! - `UPLINK_HTTP_PORT`: Operator API port override
//! - `RUST_LOG`: Logging level (default: `info`)

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use channel_uplink::api::{self, AppState};
use channel_uplink::config::Config;
use channel_uplink::endpoint::{EndpointResolver, HttpControlPlane};
use channel_uplink::session::SessionController;
use channel_uplink::source::HttpSourceOpener;
use channel_uplink::transport::HttpMediaTransport;

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::load().context("failed to load configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        stream_name = %config.stream.name,
        region = %config.stream.region,
        bind_address = %config.server.bind_addr(),
        "Channel uplink gateway starting"
    );

    // Create tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("channel-uplink")
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let control = HttpControlPlane::new(&config.control.endpoint)
            .context("failed to create control-plane client")?;
        let resolver = Arc::new(EndpointResolver::new(Arc::new(control)));

        let opener = HttpSourceOpener::new(
            config.source.base_url.clone(),
            config.source.connect_timeout(),
        )
        .context("failed to create source opener")?;

        let transport = HttpMediaTransport::new().context("failed to create uplink transport")?;

        let controller = Arc::new(SessionController::new(
            config.stream_identity(),
            resolver,
            Arc::new(opener),
            Arc::new(transport),
        ));

        let app = api::router(AppState {
            controller: controller.clone(),
        });

        let listener = tokio::net::TcpListener::bind(config.server.bind_addr())
            .await
            .with_context(|| format!("failed to bind {}", config.server.bind_addr()))?;
        info!("Operator API ready - listening for commands");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(controller))
            .await
            .context("operator API server error")?;

        Ok::<(), anyhow::Error>(())
    })?;

    info!("Channel uplink gateway shutdown complete");
    Ok(())
}

/// Wait for ctrl-c, then tear the active session down before the server exits
async fn shutdown_signal(controller: Arc<SessionController>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }

    info!("Shutdown requested, stopping active session");
    controller.stop().await;
}
