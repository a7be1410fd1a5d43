use std::{env, path::PathBuf};

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub production: bool,
    pub tls_key_path: Option<PathBuf>,
    pub tls_cert_path: Option<PathBuf>,
    pub app_url: String,
    pub supabase_url: String,
    pub supabase_service_key: String,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub google_places_api_key: Option<String>,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_price_studio: Option<String>,
    pub stripe_price_agency: Option<String>,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
    pub vapid_subject: String,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
    pub session_ttl_hours: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = parse_u16(env::var("PORT").ok(), 9001);

        let production = env::var("APP_ENV")
            .ok()
            .map(|value| value.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let supabase_url = env::var("SUPABASE_URL")
            .map_err(|_| anyhow::anyhow!("SUPABASE_URL environment variable is not set"))?;
        let supabase_service_key = env::var("SUPABASE_SERVICE_ROLE_KEY").map_err(|_| {
            anyhow::anyhow!("SUPABASE_SERVICE_ROLE_KEY environment variable is not set")
        })?;

        Ok(Self {
            port,
            production,
            tls_key_path: env::var("TLS_KEY_PATH").ok().map(PathBuf::from),
            tls_cert_path: env::var("TLS_CERT_PATH").ok().map(PathBuf::from),
            app_url: env::var("APP_URL")
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            supabase_url: supabase_url.trim().trim_end_matches('/').to_string(),
            supabase_service_key,
            google_client_id: non_empty(env::var("GOOGLE_CLIENT_ID").ok()),
            google_client_secret: non_empty(env::var("GOOGLE_CLIENT_SECRET").ok()),
            google_redirect_uri: non_empty(env::var("GOOGLE_REDIRECT_URI").ok()),
            google_places_api_key: non_empty(env::var("GOOGLE_PLACES_API_KEY").ok()),
            stripe_secret_key: non_empty(env::var("STRIPE_SECRET_KEY").ok()),
            stripe_webhook_secret: non_empty(env::var("STRIPE_WEBHOOK_SECRET").ok()),
            stripe_price_studio: non_empty(env::var("STRIPE_PRICE_STUDIO").ok()),
            stripe_price_agency: non_empty(env::var("STRIPE_PRICE_AGENCY").ok()),
            vapid_public_key: non_empty(env::var("VAPID_PUBLIC_KEY").ok()),
            vapid_private_key: non_empty(env::var("VAPID_PRIVATE_KEY").ok()),
            vapid_subject: env::var("VAPID_SUBJECT")
                .unwrap_or_else(|_| "mailto:support@leadforge.app".to_string()),
            browserless_url: non_empty(env::var("BROWSERLESS_URL").ok()),
            browserless_token: non_empty(env::var("BROWSERLESS_TOKEN").ok()),
            session_ttl_hours: parse_i64(env::var("SESSION_TTL_HOURS").ok(), 720),
        })
    }

    /// Configuration for tests. Every downstream URL points at a closed local
    /// port so an unexpected network call fails instead of leaving the box.
    #[cfg(test)]
    pub fn test_default() -> Self {
        Self {
            port: 0,
            production: false,
            tls_key_path: None,
            tls_cert_path: None,
            app_url: "http://app.test".to_string(),
            supabase_url: "http://127.0.0.1:9".to_string(),
            supabase_service_key: "service-key".to_string(),
            google_client_id: Some("client-id".to_string()),
            google_client_secret: Some("client-secret".to_string()),
            google_redirect_uri: Some("http://app.test/api/gmail/callback".to_string()),
            google_places_api_key: None,
            stripe_secret_key: Some("sk_test_123".to_string()),
            stripe_webhook_secret: Some("whsec_test".to_string()),
            stripe_price_studio: Some("price_studio".to_string()),
            stripe_price_agency: Some("price_agency".to_string()),
            vapid_public_key: None,
            vapid_private_key: None,
            vapid_subject: "mailto:test@leadforge.app".to_string(),
            browserless_url: None,
            browserless_token: None,
            session_ttl_hours: 720,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u16(value: Option<String>, fallback: u16) -> u16 {
    value
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

fn parse_i64(value: Option<String>, fallback: i64) -> i64 {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_values_are_treated_as_missing() {
        assert_eq!(non_empty(Some("   ".to_string())), None);
        assert_eq!(non_empty(Some(" key ".to_string())), Some("key".to_string()));
        assert_eq!(non_empty(None), None);
    }

    #[test]
    fn numeric_fallbacks_reject_zero_and_garbage() {
        assert_eq!(parse_u16(Some("0".to_string()), 9001), 9001);
        assert_eq!(parse_u16(Some("abc".to_string()), 9001), 9001);
        assert_eq!(parse_u16(Some("8080".to_string()), 9001), 8080);
        assert_eq!(parse_i64(Some("-4".to_string()), 720), 720);
        assert_eq!(parse_i64(Some("24".to_string()), 720), 24);
    }
}
