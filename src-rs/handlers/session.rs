use axum::{
    extract::{rejection::JsonRejection, Extension, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    auth::hash_token,
    error::{AppError, AppResult},
    handlers::{parse_body, required},
    middleware::AuthenticatedUser,
    models::{SessionRevocation, SessionRow, USER_SESSIONS},
    sessions::{decide_heartbeat, format_timestamp, Heartbeat, HeartbeatDecision},
    state::AppState,
    store::eq,
};

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub fingerprint: Option<String>,
    #[serde(alias = "deviceLabel")]
    pub device_label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RevokeRequest {
    pub fingerprint: Option<String>,
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> AppResult<Response> {
    let body = parse_body(payload)?;
    let fingerprint = required(body.fingerprint, "fingerprint")?;
    let token_hash = hash_token(&user.token);

    let existing: Option<SessionRow> = state
        .store
        .select_one(
            USER_SESSIONS,
            &[("user_id", eq(&user.id)), ("fingerprint", eq(&fingerprint))],
        )
        .await?;

    let beat = Heartbeat {
        user_id: &user.id,
        fingerprint: &fingerprint,
        token_hash: &token_hash,
        device_label: body.device_label.as_deref().filter(|label| !label.trim().is_empty()),
        now: Utc::now(),
        ttl: Duration::hours(state.config.session_ttl_hours),
    };

    match decide_heartbeat(existing.as_ref(), &beat) {
        HeartbeatDecision::Revoked => {
            tracing::info!(user_id = %user.id, fingerprint = %fingerprint, "heartbeat from revoked session");
            Ok((
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Session revoked", "revoked": true })),
            )
                .into_response())
        }
        HeartbeatDecision::Record {
            row,
            refreshed_stale,
            cleared_revocation,
        } => {
            if refreshed_stale || cleared_revocation {
                tracing::debug!(
                    user_id = %user.id,
                    fingerprint = %fingerprint,
                    refreshed_stale,
                    cleared_revocation,
                    "session superseded"
                );
            }

            state
                .store
                .upsert(USER_SESSIONS, "user_id,fingerprint", &row)
                .await?;

            Ok(Json(json!({
                "ok": true,
                "revoked": false,
                "expiresAt": row.expires_at,
            }))
            .into_response())
        }
    }
}

/// Revokes one of the caller's own device sessions.
pub async fn revoke(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<RevokeRequest>, JsonRejection>,
) -> AppResult<Json<serde_json::Value>> {
    let body = parse_body(payload)?;
    let fingerprint = required(body.fingerprint, "fingerprint")?;
    let filters = [("user_id", eq(&user.id)), ("fingerprint", eq(&fingerprint))];

    let existing: Option<SessionRow> = state.store.select_one(USER_SESSIONS, &filters).await?;
    if existing.is_none() {
        return Err(AppError::not_found("Session not found."));
    }

    let revoked_at = format_timestamp(Utc::now());
    state
        .store
        .update(
            USER_SESSIONS,
            &filters,
            &SessionRevocation {
                revoked_at: revoked_at.clone(),
            },
        )
        .await?;

    tracing::info!(user_id = %user.id, fingerprint = %fingerprint, "session revoked");
    Ok(Json(json!({ "ok": true, "revokedAt": revoked_at })))
}
