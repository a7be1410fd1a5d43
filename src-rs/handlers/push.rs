use axum::extract::{rejection::JsonRejection, Json, State};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    handlers::parse_body,
    state::AppState,
    web_push::{PushError, PushSubscription},
};

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub subscription: Option<PushSubscription>,
    #[serde(default)]
    pub payload: Value,
}

/// Strings go out as-is; anything else is sent as its JSON text.
pub fn payload_bytes(payload: &Value) -> Vec<u8> {
    match payload {
        Value::String(text) => text.as_bytes().to_vec(),
        Value::Null => Vec::new(),
        other => other.to_string().into_bytes(),
    }
}

impl From<PushError> for AppError {
    fn from(error: PushError) -> Self {
        match error {
            PushError::NotConfigured => {
                AppError::Internal(anyhow::anyhow!("VAPID keys are not configured."))
            }
            PushError::InvalidRequest(message) => AppError::BadRequest(message),
            PushError::Rejected { status, body } => AppError::Upstream { status, body },
            PushError::Failed(error) => AppError::Internal(error),
        }
    }
}

pub async fn send_push(
    State(state): State<AppState>,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let body = parse_body(payload)?;
    let subscription = body
        .subscription
        .ok_or_else(|| AppError::bad_request("Missing required field: subscription"))?;

    let status = state
        .push
        .send(&subscription, &payload_bytes(&body.payload))
        .await?;

    Ok(Json(json!({ "ok": true, "status": status })))
}
