//! `GET /playlist.m3u`

use axum::extract::State;
use axum::http::{header, HeaderMap, Uri};
use axum::response::{IntoResponse, Response};

use crate::playlist::{parse_group_filter, parse_id_filter, render_playlist, PlaylistFilters};
use crate::web::extractors::{base_url, extract_region};
use crate::web::{query_pairs, AppState};

pub const M3U_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

pub async fn playlist(State(state): State<AppState>, headers: HeaderMap, uri: Uri) -> Response {
    let query = query_pairs(&uri);
    let lookup = |key: &str| -> Option<&str> {
        query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };

    let mut filters = PlaylistFilters::new();
    filters.region = extract_region(&headers, &query);
    filters.groups = lookup("group").and_then(parse_group_filter);
    filters.ids = lookup("ids").and_then(parse_id_filter);
    filters.include_variants = lookup("variants") != Some("false");

    let channels = state.registry().snapshot().await;
    let body = render_playlist(
        &channels,
        &base_url(&headers),
        state.server.token.as_deref(),
        &filters,
    );
    ([(header::CONTENT_TYPE, M3U_CONTENT_TYPE)], body).into_response()
}
