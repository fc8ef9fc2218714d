//! Stream control and status endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use super::{ApiError, AppState};
use crate::channel::{ChannelState, NoiseColor};
use crate::health::{ChannelHealth, HealthStatus, HealthSummary};
use crate::registry::{StartReport, StopReport};
use crate::supervisor::ChannelStatus;

const SERVICE_NAME: &str = "Noise Stream";
const SERVICE_DESCRIPTION: &str = "HLS audio streaming of generated noise";

/// Response body for `GET /`
#[derive(Debug, Serialize)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub version: &'static str,
    pub endpoints: BTreeMap<&'static str, &'static str>,
    pub available_noise: Vec<NoiseColor>,
    pub channels: Vec<String>,
    pub active_streams: usize,
    pub total_streams: usize,
}

/// Service metadata
///
/// GET /
pub async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    let channels = state.registry.channels();
    let active_streams = channels
        .iter()
        .filter(|c| c.snapshot().state == ChannelState::Running)
        .count();

    let endpoints = BTreeMap::from([
        ("status", "/status"),
        ("health", "/health"),
        ("metrics", "/metrics"),
        ("start_all", "POST /stream/start"),
        ("stop_all", "POST /stream/stop"),
        ("stream_info", "/stream/{stream_id}"),
        ("stream_health", "/stream/{stream_id}/health"),
        ("stream_start", "POST /stream/{stream_id}/start"),
        ("stream_stop", "POST /stream/{stream_id}/stop"),
        ("stream_hls", "/hls/{stream_id}/stream.m3u8"),
    ]);

    Json(ServiceInfo {
        name: SERVICE_NAME,
        description: SERVICE_DESCRIPTION,
        version: env!("CARGO_PKG_VERSION"),
        endpoints,
        available_noise: NoiseColor::ALL.to_vec(),
        channels: channels.iter().map(|c| c.id().to_string()).collect(),
        active_streams,
        total_streams: channels.len(),
    })
}

/// Response body for `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub pipeline: String,
    pub uptime_s: u64,
    pub hls_dir_available: bool,
    pub summary: HealthSummary,
    pub channels: Vec<ChannelHealth>,
}

/// Aggregated service health
///
/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registry = &state.registry;
    let aggregate = registry.health().await;
    let hls_dir_available = registry.store().is_readable().await;

    let status = if hls_dir_available {
        aggregate.status
    } else {
        HealthStatus::Unhealthy
    };
    let code = match status {
        HealthStatus::Unhealthy => StatusCode::INTERNAL_SERVER_ERROR,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };

    (
        code,
        Json(HealthResponse {
            status,
            pipeline: registry.pipeline().to_string(),
            uptime_s: state.started_at.elapsed().as_secs(),
            hls_dir_available,
            summary: aggregate.summary,
            channels: aggregate.channels,
        }),
    )
}

/// Response body for `GET /status`
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub hls_dir: String,
    pub total_streams: usize,
    pub running_streams: usize,
    pub stopped_streams: usize,
    pub streams: BTreeMap<String, ChannelStatus>,
}

/// Per-channel status
///
/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let streams = state.registry.status().await;
    let count = |wanted: ChannelState| streams.values().filter(|s| s.state() == wanted).count();

    Json(StatusResponse {
        hls_dir: state.registry.store().root().display().to_string(),
        total_streams: streams.len(),
        running_streams: count(ChannelState::Running),
        stopped_streams: count(ChannelState::Stopped),
        streams,
    })
}

/// Response body for `POST /stream/start`
#[derive(Debug, Serialize)]
pub struct StartAllResponse {
    pub success: bool,
    pub message: String,
    pub total_streams: usize,
    pub started: usize,
    pub failed: usize,
    pub streams: Vec<StartReport>,
}

/// Start every channel
///
/// POST /stream/start
pub async fn start_all(State(state): State<AppState>) -> Json<StartAllResponse> {
    let streams = state.registry.start_all().await;
    let started = streams.iter().filter(|r| r.started).count();
    let failed = streams.len() - started;

    Json(StartAllResponse {
        success: started > 0,
        message: format!("Started {} streams, {} failed", started, failed),
        total_streams: streams.len(),
        started,
        failed,
        streams,
    })
}

/// Response body for `POST /stream/stop`
#[derive(Debug, Serialize)]
pub struct StopAllResponse {
    pub success: bool,
    pub message: String,
    pub stopped: usize,
    pub streams: Vec<StopReport>,
}

/// Stop every channel
///
/// POST /stream/stop
pub async fn stop_all(State(state): State<AppState>) -> Json<StopAllResponse> {
    let streams = state.registry.stop_all().await;
    let stopped = streams.iter().filter(|r| r.stopped).count();

    Json(StopAllResponse {
        success: streams.iter().all(|r| r.error.is_none()),
        message: format!("Stopped {} streams", stopped),
        stopped,
        streams,
    })
}

/// Response body for `GET /stream/:id`
#[derive(Debug, Serialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub noise_type: NoiseColor,
    pub state: ChannelState,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub hls_path: String,
    pub stream_url: String,
    pub restarts: u64,
    pub staleness_s: Option<f64>,
    /// Segments currently listed in the playlist
    pub window: Vec<String>,
}

/// Single channel info
///
/// GET /stream/:stream_id
pub async fn stream_info(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StreamInfo>, ApiError> {
    let channel = state.registry.get(&stream_id)?;
    let status = channel.status().await;
    let snapshot = status.snapshot;

    Ok(Json(StreamInfo {
        stream_id: status.stream_id,
        noise_type: status.noise_type,
        state: snapshot.state,
        running: snapshot.pid.is_some(),
        pid: snapshot.pid,
        started_at: snapshot.started_at,
        error_message: snapshot.last_error,
        hls_path: channel.dir().path().display().to_string(),
        stream_url: status.stream_url,
        restarts: snapshot.restarts,
        staleness_s: status.staleness_s,
        window: channel.dir().window().await,
    }))
}

/// Single channel health; 500 when the channel is crash-looping
///
/// GET /stream/:stream_id/health
pub async fn stream_health(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let health = state.registry.channel_health(&stream_id).await?;
    let code = match health.status {
        HealthStatus::Unhealthy => StatusCode::INTERNAL_SERVER_ERROR,
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
    };
    Ok((code, Json(health)))
}

/// Start one channel
///
/// POST /stream/:stream_id/start
pub async fn start_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StartReport>, ApiError> {
    let channel = state.registry.get(&stream_id)?;
    let outcome = channel.start().await?;
    Ok(Json(StartReport::new(channel, &Ok(outcome))))
}

/// Stop one channel
///
/// POST /stream/:stream_id/stop
pub async fn stop_stream(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> Result<Json<StopReport>, ApiError> {
    let channel = state.registry.get(&stream_id)?;
    let outcome = channel.stop().await?;
    Ok(Json(StopReport::new(channel, &Ok(outcome))))
}
