use anyhow::{anyhow, Context};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::{
    header::{HeaderMap, HeaderValue},
    StatusCode,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};

/// Validates end-user access tokens against the identity provider.
#[derive(Clone)]
pub struct AuthService {
    http: reqwest::Client,
    user_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    pub email: Option<String>,
    pub picture: Option<String>,
    pub email_verified: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Invalid Authorization header format")]
    Malformed,
    #[error("token rejected by identity provider")]
    Rejected,
    #[error(transparent)]
    Unavailable(#[from] anyhow::Error),
}

impl AuthService {
    pub fn new(supabase_url: &str, api_key: &str) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(api_key).context("invalid identity provider API key")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build auth HTTP client")?;

        Ok(Self {
            http,
            user_url: format!("{}/auth/v1/user", supabase_url.trim_end_matches('/')),
        })
    }

    pub async fn verify_bearer_token(
        &self,
        authorization_header: &str,
    ) -> Result<IdentityUser, TokenError> {
        let token = extract_bearer_token(authorization_header).map_err(|_| TokenError::Malformed)?;
        self.verify_token(token).await
    }

    pub async fn verify_token(&self, token: &str) -> Result<IdentityUser, TokenError> {
        let response = self
            .http
            .get(&self.user_url)
            .bearer_auth(token)
            .send()
            .await
            .context("failed to call identity provider")?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(TokenError::Rejected);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Unavailable(anyhow!(
                "identity provider returned status {}: {}",
                status,
                body
            )));
        }

        let user = response
            .json::<IdentityUser>()
            .await
            .context("failed to decode identity provider user")?;

        tracing::debug!(user_id = %user.id, "verified bearer token");
        Ok(user)
    }
}

pub fn extract_bearer_token(value: &str) -> anyhow::Result<&str> {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let token = parts.next().unwrap_or_default();

    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return Err(anyhow!("Invalid Authorization header format"));
    }

    Ok(token.trim())
}

/// Hex SHA-256 of a raw bearer token. Only the hash is ever persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Reads the payload of an identity token handed to us directly by the
/// provider's token endpoint. The signature is not checked.
pub fn decode_id_token_claims(token: &str) -> anyhow::Result<IdTokenClaims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<IdTokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .context("failed to decode identity token payload")?;
    Ok(data.claims)
}
