pub mod billing;
pub mod gmail;
pub mod leads;
pub mod push;
pub mod pwa;
pub mod render;
pub mod session;
pub mod tracking;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::{error::AppError, state::AppState};

pub async fn health(State(state): State<AppState>) -> Response {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok", "store": "ok" }))).into_response(),
        Err(error) => {
            tracing::error!(error = %error, "failed to reach the store");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "degraded", "store": error.to_string() })),
            )
                .into_response()
        }
    }
}

pub async fn not_found() -> Response {
    AppError::not_found("Not Found").into_response()
}

/// Unwraps a JSON body, turning any extractor rejection into a 400.
pub(crate) fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::bad_request(rejection.body_text()))
}

pub(crate) fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::bad_request(format!("Missing required field: {field}")))
}
