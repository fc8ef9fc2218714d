//! HLS file serving
//!
//! Files are streamed straight from the segment store with `ServeFile`. The
//! encoder only ever renames complete files into place, so whatever is found
//! under a final name can be served as-is.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderValue, StatusCode,
    },
    response::Response,
};
use tower::ServiceExt;
use tower_http::services::ServeFile;

use super::{ApiError, AppState};
use crate::error::Error;
use crate::metrics::global_metrics;
use crate::segment::{HlsFile, HlsFileKind};

/// Playlist or segment of one channel
///
/// GET /hls/:stream_id/:filename
pub async fn channel_file(
    State(state): State<AppState>,
    Path((stream_id, filename)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    global_metrics().hls_requested();

    let channel = state.registry.get(&stream_id)?;
    let file = channel.dir().resolve(&filename)?;

    if !is_file(&file).await {
        global_metrics().hls_missing();
        tracing::debug!(channel = %stream_id, file = %filename, "HLS file not found");
        return Err(not_found(&filename));
    }

    serve(file, request).await
}

/// Looks the file up in each channel directory, in configured order
///
/// GET /hls/:filename
pub async fn legacy_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    global_metrics().hls_requested();
    HlsFileKind::from_file_name(&filename)?;

    for channel in state.registry.channels() {
        let file = channel.dir().resolve(&filename)?;
        if is_file(&file).await {
            return serve(file, request).await;
        }
    }

    global_metrics().hls_missing();
    Err(not_found(&filename))
}

async fn serve(file: HlsFile, request: Request) -> Result<Response, ApiError> {
    let response = match ServeFile::new(&file.path).oneshot(request).await {
        Ok(response) => response,
        Err(never) => match never {},
    };

    // Evicted between the existence check and the open
    if response.status() == StatusCode::NOT_FOUND {
        global_metrics().hls_missing();
        let name = file
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Err(not_found(&name));
    }

    let mut response = response.map(Body::new);
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(file.kind.content_type()),
    );
    if let Some(cache_control) = file.kind.cache_control() {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }
    Ok(response)
}

async fn is_file(file: &HlsFile) -> bool {
    tokio::fs::metadata(&file.path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

fn not_found(name: &str) -> ApiError {
    Error::NotFound(format!("File {}", name)).into()
}
