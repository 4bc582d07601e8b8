//! Operator endpoints
//!
//! The two logical commands of the gateway, start forwarding a channel
//! and stop the current session, plus read-only status and metrics.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::metrics;
use crate::session::{SessionController, SessionStatus};
use crate::transport::AckEvent;

/// Shared state for the operator API
#[derive(Clone)]
pub struct AppState {
    /// The one session controller of this gateway
    pub controller: Arc<SessionController>,
}

/// Build the operator router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/uplink/start", post(start_uplink))
        .route("/api/uplink/stop", post(stop_uplink))
        .route("/api/uplink/status", get(uplink_status))
        .route("/api/uplink/metrics", get(uplink_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request body for starting a channel
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    /// Channel to forward
    pub channel_id: String,
}

/// Session status as reported to operators
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Current session status
    pub status: String,

    /// Id of the current session, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Channel the session is forwarding, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,

    /// Remote stream this gateway uploads to
    pub stream_name: String,

    /// Most recent acknowledgment, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ack: Option<AckEvent>,

    /// Most recent failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Response body for a stop
#[derive(Debug, Serialize)]
pub struct StopResponse {
    /// Status after the stop (always idle)
    pub status: String,

    /// Handles that did not close cleanly, if any
    pub release_warnings: Vec<String>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

async fn status_body(controller: &SessionController) -> StatusResponse {
    StatusResponse {
        status: controller.status().await.to_string(),
        session_id: controller.session_id().await,
        channel_id: controller.current_channel().await,
        stream_name: controller.stream_identity().stream_name.clone(),
        last_ack: controller.last_ack_event().await,
        last_error: controller.last_error().await.map(|e| e.to_string()),
    }
}

/// Start forwarding a channel (stops any live session first)
///
/// POST /api/uplink/start
async fn start_uplink(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> impl IntoResponse {
    let status = state.controller.start(&req.channel_id).await;

    if status == SessionStatus::Failed {
        let message = state
            .controller
            .last_error()
            .await
            .map(|e| e.to_string())
            .unwrap_or_else(|| "start failed".to_string());

        return (
            StatusCode::BAD_GATEWAY,
            Json(ErrorResponse {
                error: "start_failed".to_string(),
                message,
            }),
        )
            .into_response();
    }

    (StatusCode::OK, Json(status_body(&state.controller).await)).into_response()
}

/// Stop the current session
///
/// POST /api/uplink/stop
async fn stop_uplink(State(state): State<AppState>) -> impl IntoResponse {
    let warnings = state.controller.stop().await;

    (
        StatusCode::OK,
        Json(StopResponse {
            status: state.controller.status().await.to_string(),
            release_warnings: warnings.iter().map(|w| w.to_string()).collect(),
        }),
    )
        .into_response()
}

/// Get session status
///
/// GET /api/uplink/status
async fn uplink_status(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(status_body(&state.controller).await)).into_response()
}

/// Get gateway metrics
///
/// GET /api/uplink/metrics
async fn uplink_metrics() -> impl IntoResponse {
    Json(metrics::global_metrics().snapshot())
}
