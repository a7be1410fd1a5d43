use axum::extract::{rejection::JsonRejection, Extension, Json, State};
use serde::Deserialize;

use crate::{
    browser::{validate_render_url, RenderedPage},
    error::{AppError, AppResult},
    handlers::{parse_body, required},
    middleware::AuthenticatedUser,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RenderRequest {
    pub url: Option<String>,
}

pub async fn render_page(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<RenderRequest>, JsonRejection>,
) -> AppResult<Json<RenderedPage>> {
    let body = parse_body(payload)?;
    let raw = required(body.url, "url")?;
    let url = validate_render_url(&raw)
        .ok_or_else(|| AppError::bad_request("url must be an http(s) URL."))?;

    tracing::debug!(user_id = %user.id, url = %url, "rendering page");
    let page = state.browser.render(&url).await?;
    Ok(Json(page))
}
