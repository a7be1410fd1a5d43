use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{auth::TokenError, error::AppError, state::AppState};

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
    /// Raw bearer token as presented, for handlers that fingerprint it.
    pub token: String,
}

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = match request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) => value.to_string(),
        None => return AppError::Unauthorized.into_response(),
    };

    let user = match state.auth.verify_bearer_token(&auth_header).await {
        Ok(user) => user,
        Err(TokenError::Unavailable(error)) => {
            tracing::error!(error = %error, "identity provider unavailable");
            return AppError::Internal(error).into_response();
        }
        Err(error) => {
            tracing::warn!(error = %error, "authorization failed");
            return AppError::Unauthorized.into_response();
        }
    };

    let token = crate::auth::extract_bearer_token(&auth_header)
        .map(ToString::to_string)
        .unwrap_or_default();

    request.extensions_mut().insert(AuthenticatedUser {
        id: user.id,
        email: user.email,
        token,
    });

    next.run(request).await
}
