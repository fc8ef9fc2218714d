//! HTTP API for the noise stream service
//!
//! - `GET /` - Service metadata
//! - `GET /health`, `GET /status` - Aggregated health and per-channel status
//! - `POST /stream/start`, `POST /stream/stop` - Bulk control
//! - `GET /stream/:id`, `GET /stream/:id/health` - Single channel
//! - `POST /stream/:id/start`, `POST /stream/:id/stop` - Single channel control
//! - `GET /hls/:id/:filename`, `GET /hls/:filename` - Playlist and segments
//! - `GET /metrics` - Service metrics

pub mod hls;
pub mod streams;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::Error;
use crate::metrics::{global_metrics, MetricsSnapshot};
use crate::registry::StreamRegistry;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<StreamRegistry>, config: Arc<Config>) -> Self {
        Self {
            registry,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Build the HTTP API router
pub fn build_router(state: AppState) -> Router {
    // Players are served from other origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(streams::service_info))
        .route("/health", get(streams::health))
        .route("/status", get(streams::status))
        // Bulk control
        .route("/stream/start", post(streams::start_all))
        .route("/stream/stop", post(streams::stop_all))
        // Single channel
        .route("/stream/:stream_id", get(streams::stream_info))
        .route("/stream/:stream_id/health", get(streams::stream_health))
        .route("/stream/:stream_id/start", post(streams::start_stream))
        .route("/stream/:stream_id/stop", post(streams::stop_stream))
        // HLS output
        .route("/hls/:stream_id/:filename", get(hls::channel_file))
        .route("/hls/:filename", get(hls::legacy_file))
        .route("/metrics", get(metrics_handler))
        // Middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Metrics endpoint
async fn metrics_handler() -> Json<MetricsSnapshot> {
    Json(global_metrics().snapshot())
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Maps crate errors onto HTTP responses with an [`ErrorResponse`] body
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.kind().to_string(),
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
