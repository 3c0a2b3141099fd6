//! REST surface: channel CRUD, programme lists, tuners and metrics

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AmpsError;
use crate::models::{Channel, Program};
use crate::web::AppState;

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<Channel>> {
    Json(state.registry().snapshot().await)
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<Channel>, AmpsError> {
    state
        .registry()
        .get(id)
        .await
        .map(Json)
        .ok_or_else(|| AmpsError::not_found("stream", id))
}

pub async fn add_stream(
    State(state): State<AppState>,
    body: Result<Json<Channel>, axum::extract::rejection::JsonRejection>,
) -> Result<Response, AmpsError> {
    let Json(channel) = body.map_err(|e| AmpsError::bad_request(e.to_string()))?;
    let added = state.channels.add(channel).await?;
    Ok((StatusCode::CREATED, Json(added)).into_response())
}

pub async fn update_stream(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: Result<Json<Channel>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Channel>, AmpsError> {
    let Json(channel) = body.map_err(|e| AmpsError::bad_request(e.to_string()))?;
    if channel.id != id {
        return Err(AmpsError::bad_request(format!(
            "body id {} does not match url id {id}",
            channel.id
        )));
    }
    let replaced = state.channels.replace(id, channel).await?;
    Ok(Json(replaced))
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<serde_json::Value>, AmpsError> {
    let removed = state.channels.delete(id).await?;
    Ok(Json(json!({
        "message": "stream deleted",
        "stream": removed,
    })))
}

pub async fn get_programs(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<Vec<Program>>, AmpsError> {
    state.channels.get_programs(id).await.map(Json)
}

pub async fn put_programs(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    body: Result<Json<Vec<Program>>, axum::extract::rejection::JsonRejection>,
) -> Result<Json<Vec<Program>>, AmpsError> {
    let Json(programs) = body.map_err(|e| AmpsError::bad_request(e.to_string()))?;
    state.channels.replace_programs(id, programs).await.map(Json)
}

/// Live transcoder snapshot backing `amps tuners`
pub async fn tuners(State(state): State<AppState>) -> Json<serde_json::Value> {
    let live = state.manager().list_live().await;
    Json(json!({ "tuners": live }))
}

/// Open endpoint with process counters
pub async fn metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stats = state.manager().stats().await;
    Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "stream_count": state.registry().len().await,
        "live_transcoders": stats.live_records,
        "subscribers": stats.subscribers,
        "total_restarts": stats.total_restarts,
    }))
}

/// Token-protected graceful stop backing `amps shutdown`
pub async fn shutdown(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.request_shutdown();
    Json(json!({ "message": "shutting down" }))
}
