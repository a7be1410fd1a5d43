use anyhow::{anyhow, Context};
use serde::Deserialize;

use crate::auth::decode_id_token_claims;

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";
const TOKENINFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

pub const GMAIL_SCOPES: &[&str] = &[
    "openid",
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/userinfo.profile",
    "https://www.googleapis.com/auth/gmail.send",
    "https://www.googleapis.com/auth/gmail.readonly",
];

#[derive(Clone)]
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    client_id: Option<String>,
    client_secret: Option<String>,
    redirect_uri: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
}

impl TokenResponse {
    pub fn scopes(&self) -> Vec<String> {
        self.scope
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(ToString::to_string)
            .collect()
    }
}

/// Email and avatar of the account that granted consent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountIdentity {
    pub email: String,
    pub avatar_url: Option<String>,
}

/// Places the account email can come from, in the order they are tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailSource {
    IdToken,
    UserInfo,
    TokenInfo,
}

pub const EMAIL_SOURCES: [EmailSource; 3] = [
    EmailSource::IdToken,
    EmailSource::UserInfo,
    EmailSource::TokenInfo,
];

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    email: Option<String>,
}

impl GoogleOAuthClient {
    pub fn new(
        client_id: Option<String>,
        client_secret: Option<String>,
        redirect_uri: Option<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Google OAuth HTTP client")?;

        Ok(Self {
            http,
            client_id,
            client_secret,
            redirect_uri,
        })
    }

    fn credentials(&self) -> anyhow::Result<(&str, &str, &str)> {
        match (
            self.client_id.as_deref(),
            self.client_secret.as_deref(),
            self.redirect_uri.as_deref(),
        ) {
            (Some(id), Some(secret), Some(redirect)) => Ok((id, secret, redirect)),
            _ => Err(anyhow!(
                "GOOGLE_CLIENT_ID, GOOGLE_CLIENT_SECRET and GOOGLE_REDIRECT_URI must be configured."
            )),
        }
    }

    /// Consent screen URL. `state` carries the user id back to the callback.
    pub fn authorization_url(&self, state: &str) -> anyhow::Result<String> {
        let (client_id, _, redirect_uri) = self.credentials()?;
        let scope = GMAIL_SCOPES.join(" ");
        let params = [
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("include_granted_scopes", "true"),
            ("state", state),
        ];

        let query = params
            .iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!("{}?{}", AUTHORIZE_URL, query))
    }

    pub async fn exchange_code(&self, code: &str) -> anyhow::Result<TokenResponse> {
        let (client_id, client_secret, redirect_uri) = self.credentials()?;
        let params = [
            ("code", code),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];

        let response = self
            .http
            .post(TOKEN_URL)
            .form(&params)
            .send()
            .await
            .context("Google token exchange request failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read Google token response")?;

        if !status.is_success() {
            return Err(anyhow!(
                "Google token exchange failed with status {}: {}",
                status,
                text
            ));
        }

        serde_json::from_str(&text).context("failed to decode Google token response")
    }

    /// Tries each source in order and stops at the first that yields an email.
    /// Failures of individual sources are logged and skipped.
    pub async fn resolve_identity(&self, tokens: &TokenResponse) -> Option<AccountIdentity> {
        let mut avatar_url = None;

        for source in EMAIL_SOURCES {
            match self.resolve_from(source, tokens).await {
                Ok(Some(identity)) => {
                    tracing::debug!(source = ?source, "resolved connected account email");
                    return Some(AccountIdentity {
                        avatar_url: identity.avatar_url.or(avatar_url),
                        email: identity.email,
                    });
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(source = ?source, error = %error, "email resolution attempt failed");
                }
            }

            if avatar_url.is_none() && source == EmailSource::IdToken {
                avatar_url = tokens
                    .id_token
                    .as_deref()
                    .and_then(|token| decode_id_token_claims(token).ok())
                    .and_then(|claims| claims.picture);
            }
        }

        None
    }

    async fn resolve_from(
        &self,
        source: EmailSource,
        tokens: &TokenResponse,
    ) -> anyhow::Result<Option<AccountIdentity>> {
        match source {
            EmailSource::IdToken => {
                let Some(id_token) = tokens.id_token.as_deref() else {
                    return Ok(None);
                };
                let claims = decode_id_token_claims(id_token)?;
                if claims.email_verified == Some(false) {
                    return Ok(None);
                }
                Ok(identity(claims.email, claims.picture))
            }
            EmailSource::UserInfo => {
                let response = self
                    .http
                    .get(USERINFO_URL)
                    .bearer_auth(&tokens.access_token)
                    .send()
                    .await
                    .context("userinfo request failed")?;
                if !response.status().is_success() {
                    return Err(anyhow!("userinfo returned status {}", response.status()));
                }
                let info: UserInfo = response
                    .json()
                    .await
                    .context("failed to decode userinfo")?;
                Ok(identity(info.email, info.picture))
            }
            EmailSource::TokenInfo => {
                let response = self
                    .http
                    .get(TOKENINFO_URL)
                    .query(&[("access_token", tokens.access_token.as_str())])
                    .send()
                    .await
                    .context("tokeninfo request failed")?;
                if !response.status().is_success() {
                    return Err(anyhow!("tokeninfo returned status {}", response.status()));
                }
                let info: TokenInfo = response
                    .json()
                    .await
                    .context("failed to decode tokeninfo")?;
                Ok(identity(info.email, None))
            }
        }
    }
}

fn identity(email: Option<String>, avatar_url: Option<String>) -> Option<AccountIdentity> {
    let email = email
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())?;
    Some(AccountIdentity { email, avatar_url })
}
