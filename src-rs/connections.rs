use chrono::{DateTime, Duration, Utc};

use crate::{
    google_oauth::TokenResponse,
    models::{Credential, CredentialUpsert},
    plans::{plan_limits, PlanId},
    sessions::format_timestamp,
};

pub const STATUS_CONNECTED: &str = "connected";
pub const STATUS_DISCONNECTED: &str = "disconnected";

/// Google access tokens live an hour when the response omits `expires_in`.
const DEFAULT_ACCESS_TOKEN_SECS: i64 = 3600;

/// Builds the credential row for `account_id`. A refresh token missing from
/// `tokens` keeps the stored one.
pub fn merge_credential(
    account_id: &str,
    existing: Option<&Credential>,
    tokens: &TokenResponse,
    now: DateTime<Utc>,
) -> CredentialUpsert {
    let refresh_token = tokens
        .refresh_token
        .clone()
        .filter(|value| !value.trim().is_empty())
        .or_else(|| existing.and_then(|credential| credential.refresh_token.clone()));

    let expires_in = tokens
        .expires_in
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_ACCESS_TOKEN_SECS);

    CredentialUpsert {
        account_id: account_id.to_string(),
        refresh_token,
        access_token: tokens.access_token.clone(),
        expires_at: format_timestamp(now + Duration::seconds(expires_in)),
    }
}

/// Primary flag to write when an existing account is connected again. An
/// account that is not primary takes the role only when no other connected
/// account holds it; `None` leaves the stored flag alone.
pub fn primary_flag_on_reconnect(account_is_primary: bool, other_primary_exists: bool) -> Option<bool> {
    (!account_is_primary && !other_primary_exists).then_some(true)
}

pub fn seat_limit_reached(plan: PlanId, connected_accounts: i64) -> bool {
    connected_accounts >= plan_limits(plan).sender_seats
}

pub fn connected_redirect(app_url: &str) -> String {
    format!("{}/settings?gmail=connected", app_url.trim_end_matches('/'))
}

pub fn seat_limit_redirect(app_url: &str, plan: PlanId) -> String {
    format!(
        "{}/settings?error=seat_limit&plan={}",
        app_url.trim_end_matches('/'),
        plan.as_str()
    )
}

pub fn oauth_error_redirect(app_url: &str, reason: &str) -> String {
    format!(
        "{}/settings?error={}",
        app_url.trim_end_matches('/'),
        urlencoding::encode(reason)
    )
}
