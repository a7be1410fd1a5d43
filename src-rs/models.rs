//! Row shapes for the managed store's tables.
//!
//! Reads deserialize only the columns this service looks at; writes go
//! through the narrower `*Upsert` structs so absent columns keep their
//! stored values.

use serde::{Deserialize, Serialize};

pub const PROFILES: &str = "profiles";
pub const CONNECTED_ACCOUNTS: &str = "connected_accounts";
pub const ACCOUNT_CREDENTIALS: &str = "account_credentials";
pub const USER_SESSIONS: &str = "user_sessions";
pub const EMAIL_MESSAGES: &str = "email_messages";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    pub plan: Option<String>,
    pub plan_status: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub sender_seats_used: i64,
    #[serde(default)]
    pub agency_approved: bool,
}

/// Billing columns written by checkout and webhook reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileBillingUpsert {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    pub plan_status: String,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileCustomerUpsert<'a> {
    pub id: &'a str,
    pub stripe_customer_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileSeatsUpsert<'a> {
    pub id: &'a str,
    pub sender_seats_used: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectedAccount {
    pub id: String,
    pub status: Option<String>,
    #[serde(default)]
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewConnectedAccount<'a> {
    pub user_id: &'a str,
    pub email: &'a str,
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<&'a str>,
    pub scopes: &'a [String],
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedAccountRefresh<'a> {
    pub status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<&'a str>,
    pub scopes: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_primary: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedAccountStatus<'a> {
    pub status: &'a str,
    pub is_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrimaryFlag {
    pub is_primary: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Credential {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialUpsert {
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub access_token: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionRow {
    pub expires_at: Option<String>,
    pub token_hash: Option<String>,
    pub revoked_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUpsert {
    pub user_id: String,
    pub fingerprint: String,
    pub last_seen_at: String,
    pub expires_at: String,
    pub token_hash: String,
    pub revoked_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_label: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRevocation {
    pub revoked_at: String,
}
