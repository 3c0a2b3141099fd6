//! Programme guide endpoints: XMLTV and the JSON mirror

use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::errors::AmpsError;
use crate::playlist::epg::{build_epg_payload, build_xmltv, EpgEntry};
use crate::web::extractors::base_url;
use crate::web::AppState;

pub async fn epg_xml(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AmpsError> {
    let channels = state.registry().snapshot().await;
    let base = base_url(&headers);
    let xml = build_xmltv(&channels, Some(base.as_str()))
        .map_err(|e| AmpsError::internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], xml).into_response())
}

pub async fn epg_json(State(state): State<AppState>) -> Json<Vec<EpgEntry>> {
    let channels = state.registry().snapshot().await;
    Json(build_epg_payload(&channels))
}
