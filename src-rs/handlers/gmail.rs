use axum::{
    extract::{rejection::JsonRejection, Extension, Json, Query, State},
    http::{header::LOCATION, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    billing::load_profile,
    connections::{
        connected_redirect, merge_credential, oauth_error_redirect, primary_flag_on_reconnect,
        seat_limit_reached, seat_limit_redirect, STATUS_CONNECTED, STATUS_DISCONNECTED,
    },
    error::{AppError, AppResult},
    handlers::{parse_body, required},
    middleware::AuthenticatedUser,
    models::{
        ConnectedAccount, ConnectedAccountRefresh, ConnectedAccountStatus, Credential,
        NewConnectedAccount, PrimaryFlag, ProfileSeatsUpsert, ACCOUNT_CREDENTIALS,
        CONNECTED_ACCOUNTS, PROFILES,
    },
    plans::effective_plan,
    state::AppState,
    store::{eq, StoreClient},
};

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DisconnectRequest {
    #[serde(alias = "accountId")]
    pub account_id: Option<String>,
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(LOCATION, location)]).into_response()
}

pub async fn connect_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> AppResult<Json<Value>> {
    let url = state.google.authorization_url(&user.id)?;
    Ok(Json(json!({ "url": url })))
}

pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> AppResult<Response> {
    if let Some(error) = query.error.filter(|value| !value.trim().is_empty()) {
        tracing::warn!(error = %error, "Google consent was not granted");
        return Ok(found(oauth_error_redirect(&state.config.app_url, &error)));
    }

    let code = required(query.code, "code")?;
    let user_id = required(query.state, "state")?;

    let tokens = state.google.exchange_code(&code).await?;
    let identity = state
        .google
        .resolve_identity(&tokens)
        .await
        .ok_or_else(|| AppError::bad_request("Unable to resolve the Google account email."))?;

    let store = &state.store;
    let scopes = tokens.scopes();

    let existing: Option<ConnectedAccount> = store
        .select_one(
            CONNECTED_ACCOUNTS,
            &[("user_id", eq(&user_id)), ("email", eq(&identity.email))],
        )
        .await?;

    let account_id = match existing {
        Some(account) => {
            let reconnecting = account.status.as_deref() != Some(STATUS_CONNECTED);
            if reconnecting {
                if let Some(redirect) = seat_limit_redirect_for(&state, &user_id).await? {
                    return Ok(found(redirect));
                }
            }

            let other_primary_exists = has_connected_primary(store, &user_id).await?;
            let is_primary = primary_flag_on_reconnect(account.is_primary, other_primary_exists);

            store
                .update(
                    CONNECTED_ACCOUNTS,
                    &[("id", eq(&account.id))],
                    &ConnectedAccountRefresh {
                        status: STATUS_CONNECTED,
                        avatar_url: identity.avatar_url.as_deref(),
                        scopes: &scopes,
                        is_primary,
                    },
                )
                .await?;
            account.id
        }
        None => {
            if let Some(redirect) = seat_limit_redirect_for(&state, &user_id).await? {
                return Ok(found(redirect));
            }

            let has_primary = has_connected_primary(store, &user_id).await?;

            let account: ConnectedAccount = store
                .insert(
                    CONNECTED_ACCOUNTS,
                    &NewConnectedAccount {
                        user_id: &user_id,
                        email: &identity.email,
                        status: STATUS_CONNECTED,
                        avatar_url: identity.avatar_url.as_deref(),
                        scopes: &scopes,
                        is_primary: !has_primary,
                    },
                )
                .await?;

            tracing::info!(
                user_id = %user_id,
                account_id = %account.id,
                primary = !has_primary,
                "connected new Gmail account"
            );
            account.id
        }
    };

    sync_sender_seats(store, &user_id).await?;

    let stored: Option<Credential> = store
        .select_one(ACCOUNT_CREDENTIALS, &[("account_id", eq(&account_id))])
        .await?;
    let credential = merge_credential(&account_id, stored.as_ref(), &tokens, Utc::now());
    store
        .upsert(ACCOUNT_CREDENTIALS, "account_id", &credential)
        .await?;

    Ok(found(connected_redirect(&state.config.app_url)))
}

pub async fn disconnect(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<DisconnectRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let body = parse_body(payload)?;
    let account_id = required(body.account_id, "account_id")?;
    let store = &state.store;

    let account: ConnectedAccount = store
        .select_one(
            CONNECTED_ACCOUNTS,
            &[("id", eq(&account_id)), ("user_id", eq(&user.id))],
        )
        .await?
        .ok_or_else(|| AppError::not_found("Connected account not found."))?;

    store
        .update(
            CONNECTED_ACCOUNTS,
            &[("id", eq(&account.id))],
            &ConnectedAccountStatus {
                status: STATUS_DISCONNECTED,
                is_primary: false,
            },
        )
        .await?;

    if account.is_primary {
        let next: Option<ConnectedAccount> = store
            .select_one(
                CONNECTED_ACCOUNTS,
                &[
                    ("user_id", eq(&user.id)),
                    ("status", eq(STATUS_CONNECTED)),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await?;

        if let Some(next) = next {
            store
                .update(
                    CONNECTED_ACCOUNTS,
                    &[("id", eq(&next.id))],
                    &PrimaryFlag { is_primary: true },
                )
                .await?;
            tracing::info!(user_id = %user.id, account_id = %next.id, "promoted primary sender");
        }
    }

    let seats = sync_sender_seats(store, &user.id).await?;
    Ok(Json(json!({ "ok": true, "senderSeatsUsed": seats })))
}

/// Returns the redirect to send the user to when another connected account
/// would exceed their plan's sender seats.
async fn seat_limit_redirect_for(state: &AppState, user_id: &str) -> AppResult<Option<String>> {
    let profile = load_profile(&state.store, user_id).await?;
    let plan = effective_plan(
        profile.as_ref().and_then(|profile| profile.plan.as_deref()),
        profile.as_ref().and_then(|profile| profile.plan_status.as_deref()),
    );

    let connected = count_connected(&state.store, user_id).await?;
    if seat_limit_reached(plan, connected) {
        tracing::warn!(
            user_id = %user_id,
            plan = plan.as_str(),
            connected,
            "sender seat limit reached"
        );
        return Ok(Some(seat_limit_redirect(&state.config.app_url, plan)));
    }
    Ok(None)
}

async fn count_connected(store: &StoreClient, user_id: &str) -> anyhow::Result<i64> {
    store
        .count(
            CONNECTED_ACCOUNTS,
            &[("user_id", eq(user_id)), ("status", eq(STATUS_CONNECTED))],
        )
        .await
}

async fn has_connected_primary(store: &StoreClient, user_id: &str) -> anyhow::Result<bool> {
    let primaries = store
        .count(
            CONNECTED_ACCOUNTS,
            &[
                ("user_id", eq(user_id)),
                ("status", eq(STATUS_CONNECTED)),
                ("is_primary", eq("true")),
            ],
        )
        .await?;
    Ok(primaries > 0)
}

async fn sync_sender_seats(store: &StoreClient, user_id: &str) -> anyhow::Result<i64> {
    let seats = count_connected(store, user_id).await?;
    store
        .upsert(
            PROFILES,
            "id",
            &ProfileSeatsUpsert {
                id: user_id,
                sender_seats_used: seats,
            },
        )
        .await?;
    Ok(seats)
}
