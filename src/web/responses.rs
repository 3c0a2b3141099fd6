//! HTTP error mapping
//!
//! One place turns every application error into its status code and a
//! small JSON body, so handlers can stay thin and just use `?`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::errors::{AmpsError, RelayError};

fn relay_status(error: &RelayError) -> StatusCode {
    match error {
        RelayError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
        RelayError::BadVariant { .. } => StatusCode::BAD_REQUEST,
        RelayError::NoLaunchSpec { .. }
        | RelayError::SpawnFailed { .. }
        | RelayError::StartupExit { .. }
        | RelayError::ResolveFailed { .. }
        | RelayError::RestartBudgetExhausted { .. }
        | RelayError::NotAccepting { .. }
        | RelayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AmpsError {
    fn into_response(self) -> Response {
        let status = match &self {
            AmpsError::Unauthorized => StatusCode::UNAUTHORIZED,
            AmpsError::Forbidden { .. } => StatusCode::FORBIDDEN,
            AmpsError::NotFound { .. } => StatusCode::NOT_FOUND,
            AmpsError::Conflict { .. } => StatusCode::CONFLICT,
            AmpsError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AmpsError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AmpsError::Relay(relay) => relay_status(relay),
            AmpsError::Configuration { .. } | AmpsError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error surfaced to a client: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_the_contract() {
        assert_eq!(
            AmpsError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AmpsError::forbidden("region").into_response().status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AmpsError::not_found("stream", 9).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AmpsError::conflict("dup").into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AmpsError::bad_request("bad").into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AmpsError::unavailable("down").into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AmpsError::Relay(RelayError::BadVariant {
                channel: 1,
                variant: "x".into()
            })
            .into_response()
            .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AmpsError::Relay(RelayError::ShuttingDown)
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
