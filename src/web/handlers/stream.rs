//! `GET /stream/{id}` and `GET /audio/{id}`
//!
//! Looks the channel up, runs the region check, asks the transcoder
//! manager for a live byte source and pipes it to the client until either
//! side closes. Channels whose effective shape is segmented redirect to
//! their manifest route instead; there is no byte pipe to share.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::Response;

use crate::errors::AmpsError;
use crate::models::{Channel, OutputFormat, ProfileSpec};
use crate::playlist::variant_or_default;
use crate::relay::{OutputShape, StreamKey};
use crate::web::extractors::extract_region;
use crate::web::{query_pairs, AppState};

pub const TS_CONTENT_TYPE: &str = "video/mp2t";

/// The shape a plain `/stream` request resolves to: channel declaration
/// first, then the profile's, then raw transport stream.
fn effective_shape(channel: &Channel, profile: Option<&ProfileSpec>) -> OutputFormat {
    if channel.audio_only {
        return OutputFormat::Audio;
    }
    if let Some(format) = channel.output_format {
        return format;
    }
    profile
        .and_then(|p| p.declared_format())
        .unwrap_or(OutputFormat::Ts)
}

pub async fn stream(
    state: State<AppState>,
    path: Path<u32>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AmpsError> {
    serve(state, path, headers, uri, false).await
}

/// Like `/stream` but always forces the audio-only pipeline
pub async fn audio(
    state: State<AppState>,
    path: Path<u32>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AmpsError> {
    serve(state, path, headers, uri, true).await
}

async fn serve(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    headers: HeaderMap,
    uri: Uri,
    force_audio: bool,
) -> Result<Response, AmpsError> {
    let query = query_pairs(&uri);
    let lookup = |key: &str| -> Option<&str> {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

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

    let variant = variant_or_default(lookup("variant"));
    let effective = channel
        .resolve_variant(&variant)
        .ok_or_else(|| AmpsError::bad_request(format!("unknown variant '{variant}'")))?;

    let manager = state.manager();
    let profile = effective
        .ffmpeg_profile
        .as_deref()
        .and_then(|name| manager.profiles().get(name));
    let shape = if force_audio {
        OutputFormat::Audio
    } else {
        effective_shape(&effective, profile)
    };

    // Segmented shapes are served as files; the first playlist request
    // starts the producer over in the manifest handler.
    if shape.is_segmented() {
        let (prefix, manifest) = if shape == OutputFormat::Dash {
            ("dash", crate::relay::command::DASH_MANIFEST)
        } else {
            ("hls", crate::relay::command::HLS_MANIFEST)
        };
        let mut pairs = url::form_urlencoded::Serializer::new(String::new());
        if let Some(token) = state.server.token.as_deref() {
            pairs.append_pair("token", token);
        }
        if variant != crate::models::DEFAULT_VARIANT {
            pairs.append_pair("variant", &variant);
        }
        let q = pairs.finish();
        let location = if q.is_empty() {
            format!("/{prefix}/{id}/{manifest}")
        } else {
            format!("/{prefix}/{id}/{manifest}?{q}")
        };
        return Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .map_err(|e| AmpsError::internal(e.to_string()));
    }

    let overlap = matches!(lookup("overlap"), Some("true") | Some("1"));
    let key = if overlap {
        manager.overlap_key(id, &variant)
    } else {
        StreamKey::new(id, variant.clone(), OutputShape::from_format(shape))
    };

    let subscription = manager.open(key, &channel).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, TS_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(subscription))
        .map_err(|e| AmpsError::internal(e.to_string()))
}
