use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::IntoResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    models::EMAIL_MESSAGES, sessions::format_timestamp, state::AppState, store::eq,
};

/// Transparent 1x1 PNG.
pub static PIXEL_PNG: [u8; 68] = [
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1f,
    0x15, 0xc4, 0x89, 0x00, 0x00, 0x00, 0x0b, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60,
    0x00, 0x02, 0x00, 0x00, 0x05, 0x00, 0x01, 0x7a, 0x5e, 0xab, 0x3f, 0x00, 0x00, 0x00, 0x00,
    0x49, 0x45, 0x4e, 0x44, 0xae, 0x42, 0x60, 0x82,
];

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    pub msg: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenedAt {
    opened_at: String,
}

/// Records the first open of a message. The pixel is returned whether or not
/// the query parses or the write succeeds.
pub async fn track_open(
    State(state): State<AppState>,
    query: Result<Query<OpenQuery>, QueryRejection>,
) -> impl IntoResponse {
    let message_id = match query {
        Ok(Query(query)) => query.msg,
        Err(rejection) => {
            tracing::debug!(error = %rejection.body_text(), "unreadable tracking query");
            None
        }
    };

    if let Some(message_id) = message_id.filter(|value| !value.trim().is_empty()) {
        let result = state
            .store
            .update(
                EMAIL_MESSAGES,
                &[
                    ("id", eq(&message_id)),
                    ("opened_at", "is.null".to_string()),
                ],
                &OpenedAt {
                    opened_at: format_timestamp(Utc::now()),
                },
            )
            .await;

        if let Err(error) = result {
            tracing::warn!(message_id = %message_id, error = %error, "failed to record email open");
        }
    }

    (
        [
            (CONTENT_TYPE, "image/png"),
            (CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
        ],
        &PIXEL_PNG[..],
    )
}
