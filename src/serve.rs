use std::{path::PathBuf, time::Instant};

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::{AppState, error::ApiError};

const PLAYLIST_SUFFIX: &str = "playlist.sos";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetClass {
    Image,
    Video,
    Audio,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct AssetKind {
    pub mime: &'static str,
    pub class: AssetClass,
}

/// Lookup table from a normalized extension to MIME type and asset class.
/// Unknown extensions are rejected at validation, before any I/O.
pub fn classify_extension(remote_path: &str) -> Option<AssetKind> {
    let extension = std::path::Path::new(remote_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())?;

    let kind = match extension.as_str() {
        "png" => AssetKind {
            mime: "image/png",
            class: AssetClass::Image,
        },
        "jpg" | "jpeg" => AssetKind {
            mime: "image/jpeg",
            class: AssetClass::Image,
        },
        "mp4" => AssetKind {
            mime: "video/mp4",
            class: AssetClass::Video,
        },
        "mp3" => AssetKind {
            mime: "audio/mpeg",
            class: AssetClass::Audio,
        },
        "txt" => AssetKind {
            mime: "text/plain",
            class: AssetClass::Text,
        },
        _ => return None,
    };

    Some(kind)
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct PlaylistResponse {
    path: String,
    content: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/getPlaylist", get(get_playlist))
        .route("/getLayer", get(get_layer))
        .with_state(state)
}

async fn get_playlist(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let remote_path = query.path.as_deref().unwrap_or_default();
    if !remote_path.ends_with(PLAYLIST_SUFFIX) {
        return Err(ApiError::bad_request(format!(
            "path must point to a {PLAYLIST_SUFFIX} file"
        )));
    }

    let content = state
        .fetcher
        .fetch_text(remote_path)
        .await
        .map_err(|error| ApiError::from(error).diagnostic())?;

    let body = serde_json::to_string(&PlaylistResponse {
        path: remote_path.to_string(),
        content,
    })
    .map_err(|error| ApiError::internal(error.to_string()).diagnostic())?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from(body))
        .map_err(|error| ApiError::internal(error.to_string()).diagnostic())
}

async fn get_layer(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let remote_path = query.path.as_deref().unwrap_or_default();
    let Some(kind) = classify_extension(remote_path) else {
        return Err(ApiError::bad_request("unsupported asset extension"));
    };

    let range_header = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    // The first sub-request of a playback session carries the full
    // fetch/transcode latency; later range requests hit files already on disk.
    let first_segment = range_header.is_none_or(|value| value.starts_with("bytes=0-"));
    let started = Instant::now();

    let local = resolve_local_asset(&state, remote_path, kind.class).await?;
    let metadata = tokio::fs::metadata(&local)
        .await
        .map_err(|error| ApiError::internal(format!("could not stat {local:?}: {error}")))?;
    let total = metadata.len();

    let response = match range_header {
        None => full_response(&local, kind, total).await?,
        Some(value) => range_response(&local, kind, total, parse_range(value, total)).await?,
    };

    if first_segment {
        info!(
            path = %remote_path,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "first segment ready"
        );
    }

    Ok(response)
}

/// Decide which local file backs this request: a transcoded copy already on
/// disk (no network at all), the binary cache, or a fresh download piped
/// through the transcoder for video.
async fn resolve_local_asset(
    state: &AppState,
    remote_path: &str,
    class: AssetClass,
) -> Result<PathBuf, ApiError> {
    if class == AssetClass::Video {
        let transcoded = state.transcodes.cached_output(remote_path);
        if tokio::fs::try_exists(&transcoded).await.unwrap_or(false) {
            return Ok(transcoded);
        }
    }

    let raw = state.fetcher.fetch_binary_cached(remote_path).await?;

    if class == AssetClass::Video {
        let playable = state
            .transcodes
            .ensure_browser_playable(&raw, remote_path)
            .await?;
        Ok(playable)
    } else {
        Ok(raw)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct ByteSpan {
    start: u64,
    end: u64,
}

/// Parse `bytes=start-end`. A non-numeric start defaults to 0 and a missing
/// end to the last byte, matching what seeking video elements send.
fn parse_range(value: &str, total: u64) -> ByteSpan {
    let last = total.saturating_sub(1);
    let trimmed = value.strip_prefix("bytes=").unwrap_or(value);
    let (start_raw, end_raw) = trimmed.split_once('-').unwrap_or((trimmed, ""));

    let start = start_raw.trim().parse().unwrap_or(0);
    let end = end_raw.trim().parse().map_or(last, |end: u64| end.min(last));

    ByteSpan { start, end }
}

async fn full_response(
    local: &std::path::Path,
    kind: AssetKind,
    total: u64,
) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(local)
        .await
        .map_err(|error| ApiError::internal(format!("could not open {local:?}: {error}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, kind.mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_LENGTH, total)
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|error| ApiError::internal(error.to_string()))
}

async fn range_response(
    local: &std::path::Path,
    kind: AssetKind,
    total: u64,
    span: ByteSpan,
) -> Result<Response, ApiError> {
    if total == 0 || span.start > span.end {
        return Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .header(header::CONTENT_RANGE, format!("bytes */{total}"))
            .body(Body::empty())
            .map_err(|error| ApiError::internal(error.to_string()));
    }

    let mut file = tokio::fs::File::open(local)
        .await
        .map_err(|error| ApiError::internal(format!("could not open {local:?}: {error}")))?;
    file.seek(SeekFrom::Start(span.start))
        .await
        .map_err(|error| ApiError::internal(format!("could not seek in {local:?}: {error}")))?;

    let length = span.end - span.start + 1;
    let stream = ReaderStream::new(file.take(length));

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_TYPE, kind.mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{total}", span.start, span.end),
        )
        .body(Body::from_stream(stream))
        .map_err(|error| ApiError::internal(error.to_string()))
}
