//! Segment directory serving for HLS and DASH outputs
//!
//! Exposes each record's per-key temp directory at `/hls/{id}/{file}` and
//! `/dash/{id}/{file}`. Requesting the entry manifest starts the producer
//! when no record exists yet; every file read resets the record's idle
//! timer so active players keep their child alive.

use std::path::Path as FsPath;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::Response;

use crate::errors::AmpsError;
use crate::models::OutputFormat;
use crate::playlist::variant_or_default;
use crate::relay::command::{DASH_MANIFEST, HLS_MANIFEST};
use crate::relay::{OutputShape, StreamKey};
use crate::web::extractors::extract_region;
use crate::web::{query_pairs, AppState};

/// How long the manifest handler waits for FFmpeg's first playlist write
const MANIFEST_WAIT: Duration = Duration::from_secs(10);
const MANIFEST_POLL: Duration = Duration::from_millis(250);

fn content_type_for(file: &str) -> &'static str {
    match file.rsplit('.').next() {
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("mpd") => "application/dash+xml",
        Some("ts") => "video/mp2t",
        Some("m4s") | Some("mp4") => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Refuse anything that could escape the per-key directory
fn sanitize_component(file: &str) -> Result<&str, AmpsError> {
    let path = FsPath::new(file);
    let escapes = path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes || file.contains("..") {
        return Err(AmpsError::bad_request("invalid segment path"));
    }
    Ok(file)
}

pub async fn hls(
    state: State<AppState>,
    path: Path<(u32, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AmpsError> {
    serve_segment(state, path, headers, uri, false).await
}

pub async fn dash(
    state: State<AppState>,
    path: Path<(u32, String)>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AmpsError> {
    serve_segment(state, path, headers, uri, true).await
}

async fn serve_segment(
    State(state): State<AppState>,
    Path((id, file)): Path<(u32, String)>,
    headers: HeaderMap,
    uri: Uri,
    dash: bool,
) -> Result<Response, AmpsError> {
    let file = sanitize_component(&file)?.to_string();
    let query = query_pairs(&uri);

    let channel = state
        .registry()
        .get(id)
        .await
        .ok_or_else(|| AmpsError::not_found("stream", id))?;

    let region = extract_region(&headers, &query);
    if !channel.allowed_for_region(region.as_deref()) {
        return Err(AmpsError::forbidden(format!(
            "stream {id} is not available in your region"
        )));
    }

    let variant = variant_or_default(
        query
            .iter()
            .find(|(k, _)| k == "variant")
            .map(|(_, v)| v.as_str()),
    );

    let effective = channel
        .resolve_variant(&variant)
        .ok_or_else(|| AmpsError::bad_request(format!("unknown variant '{variant}'")))?;
    let (shape, manifest) = if dash {
        (OutputShape::Dash, DASH_MANIFEST)
    } else if effective.declared_format() == OutputFormat::LlHls || effective.ll_hls {
        (OutputShape::LlHls, HLS_MANIFEST)
    } else {
        (OutputShape::Hls, HLS_MANIFEST)
    };
    let key = StreamKey::new(id, variant, shape);
    let manager = state.manager();

    let record = if file == manifest {
        // First playlist request starts the producer
        let record = manager.ensure_running(key.clone(), &channel).await?;
        let manifest_path = record
            .output_dir()
            .map(|dir| dir.join(&file))
            .ok_or_else(|| AmpsError::unavailable("record has no segment directory"))?;
        let deadline = tokio::time::Instant::now() + MANIFEST_WAIT;
        while !manifest_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(AmpsError::unavailable("manifest was not produced in time"));
            }
            tokio::time::sleep(MANIFEST_POLL).await;
        }
        record
    } else {
        manager
            .record(&key)
            .await
            .ok_or_else(|| AmpsError::not_found("segment", &file))?
    };

    let dir = record
        .output_dir()
        .ok_or_else(|| AmpsError::unavailable("record has no segment directory"))?;
    let full = dir.join(&file);
    let bytes = tokio::fs::read(&full)
        .await
        .map_err(|_| AmpsError::not_found("segment", &file))?;

    // Any read keeps the child alive
    manager.touch(&key).await;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&file))
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(bytes))
        .map_err(|e| AmpsError::internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_components_are_refused() {
        assert!(sanitize_component("index.m3u8").is_ok());
        assert!(sanitize_component("seg_00001.ts").is_ok());
        assert!(sanitize_component("../secret").is_err());
        assert!(sanitize_component("/etc/passwd").is_err());
        assert!(sanitize_component("a/../b").is_err());
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type_for("index.m3u8"), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for("manifest.mpd"), "application/dash+xml");
        assert_eq!(content_type_for("chunk_001.ts"), "video/mp2t");
        assert_eq!(content_type_for("init.m4s"), "video/mp4");
        assert_eq!(content_type_for("mystery"), "application/octet-stream");
    }
}
