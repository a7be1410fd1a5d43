mod auth;
mod billing;
mod browser;
mod config;
mod connections;
mod error;
mod google_oauth;
mod handlers;
mod leads;
mod middleware;
mod models;
mod places;
mod plans;
mod sessions;
mod state;
mod store;
mod stripe_api;
mod web_push;

use std::{collections::HashSet, env, net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use config::Config;
use state::AppState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let loaded_env_files = load_env_files()?;
    init_tracing();
    if loaded_env_files.is_empty() {
        tracing::warn!("No .env or .env.local file found. Using process environment only.");
    } else {
        let files = loaded_env_files
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        tracing::info!(files = %files, "Loaded environment files");
    }

    let config = Config::from_env()?;

    if config.stripe_secret_key.is_none() {
        if config.production {
            return Err(anyhow::anyhow!(
                "STRIPE_SECRET_KEY environment variable is not set"
            ));
        }

        tracing::warn!(
            "STRIPE_SECRET_KEY is not set. Billing endpoints will fail until it is provided."
        );
    }
    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET is not set. Stripe webhooks will be rejected.");
    }
    if config.vapid_public_key.is_none() || config.vapid_private_key.is_none() {
        tracing::warn!("VAPID keys are not set. Push notifications are disabled.");
    }

    let state = AppState::from_config(config.clone())?;

    match state.store.ping().await {
        Ok(()) => tracing::info!("Store connectivity check passed"),
        Err(error) => {
            tracing::error!(
                error = ?error,
                supabase_url = %config.supabase_url,
                "Store connectivity check failed. Check SUPABASE_URL and SUPABASE_SERVICE_ROLE_KEY."
            );
        }
    }

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    if let Some((cert_path, key_path)) = valid_tls_paths(&config) {
        let tls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .context("failed to load TLS certificate/key")?;

        tracing::info!(
            port = config.port,
            "TLS configuration loaded. Running in HTTPS mode."
        );

        axum_server::bind_rustls(addr, tls_config)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("HTTPS server failed")?;
    } else {
        tracing::info!(port = config.port, "Running in HTTP mode.");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("failed to bind TCP listener")?;

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .context("HTTP server failed")?;
    }

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/leads/search", post(handlers::leads::search_leads))
        .route("/gmail/connect-url", get(handlers::gmail::connect_url))
        .route("/gmail/disconnect", post(handlers::gmail::disconnect))
        .route("/session/heartbeat", post(handlers::session::heartbeat))
        .route("/session/revoke", post(handlers::session::revoke))
        .route(
            "/billing/checkout",
            post(handlers::billing::create_checkout_session),
        )
        .route(
            "/billing/portal",
            post(handlers::billing::create_portal_session),
        )
        .route(
            "/billing/subscribe",
            post(handlers::billing::create_subscription),
        )
        .route("/billing/status", get(handlers::billing::billing_status))
        .route("/render", post(handlers::render::render_page))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    let public = Router::new()
        .route("/gmail/callback", get(handlers::gmail::oauth_callback))
        .route(
            "/stripe/webhook",
            post(handlers::billing::handle_stripe_webhook),
        )
        .route("/push/send", post(handlers::push::send_push))
        .route("/track/open", get(handlers::tracking::track_open));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route("/manifest.webmanifest", get(handlers::pwa::manifest))
        .route("/sw.js", get(handlers::pwa::service_worker))
        .route("/offline.html", get(handlers::pwa::offline_page))
        .nest("/api", authed.merge(public))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn valid_tls_paths(config: &Config) -> Option<(String, String)> {
    let cert_path = config
        .tls_cert_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());
    let key_path = config
        .tls_key_path
        .as_ref()
        .map(|path| path.to_string_lossy().to_string());

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_exists = std::path::Path::new(&cert_path).exists();
            let key_exists = std::path::Path::new(&key_path).exists();

            if cert_exists && key_exists {
                Some((cert_path, key_path))
            } else {
                if !key_exists {
                    tracing::error!(path = %key_path, "TLS key file not found");
                }
                if !cert_exists {
                    tracing::error!(path = %cert_path, "TLS certificate file not found");
                }
                tracing::error!("Proceeding without TLS.");
                None
            }
        }
        (Some(cert_path), None) => {
            tracing::error!(path = %cert_path, "TLS certificate file provided but TLS key path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, Some(key_path)) => {
            tracing::error!(path = %key_path, "TLS key file provided but TLS certificate path missing");
            tracing::error!("Proceeding without TLS.");
            None
        }
        (None, None) => None,
    }
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_env_files() -> anyhow::Result<Vec<PathBuf>> {
    let mut roots = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        roots.push(cwd);
    }
    if let Ok(executable_path) = env::current_exe() {
        if let Some(executable_dir) = executable_path.parent() {
            roots.push(executable_dir.to_path_buf());
        }
    }
    roots.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")));

    let mut seen_roots = HashSet::new();
    let mut loaded = Vec::new();

    for root in roots {
        let key = root.to_string_lossy().to_string();
        if !seen_roots.insert(key) {
            continue;
        }

        for filename in [".env", ".env.local"] {
            let path = root.join(filename);
            if path.is_file() {
                dotenvy::from_path(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?;
                loaded.push(path);
            }
        }
    }

    if loaded.is_empty() {
        if let Ok(path) = dotenvy::dotenv() {
            loaded.push(path);
        }
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        build_router(AppState::from_config(Config::test_default()).unwrap())
    }

    async fn send(request: Request<Body>) -> Response {
        app().oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn webhook_request(signature: Option<&str>, payload: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/stripe/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header("stripe-signature", signature);
        }
        builder.body(Body::from(payload.to_string())).unwrap()
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_rejected() {
        let payload = json!({
            "id": "evt_1",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_1", "metadata": { "user_id": "user-1" } } }
        })
        .to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let forged = stripe_api::sign_payload("whsec_other", timestamp, payload.as_bytes()).unwrap();
        let header = format!("t={},v1={}", timestamp, forged);

        let response = send(webhook_request(Some(&header), &payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Invalid signature.");
    }

    #[tokio::test]
    async fn webhook_without_signature_is_rejected() {
        let response = send(webhook_request(None, "{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn signed_but_unparseable_webhook_is_a_bad_request() {
        let payload = "not json";
        let timestamp = chrono::Utc::now().timestamp();
        let signature = stripe_api::sign_payload("whsec_test", timestamp, payload.as_bytes()).unwrap();
        let header = format!("t={},v1={}", timestamp, signature);

        let response = send(webhook_request(Some(&header), payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unhandled_event_kinds_are_acknowledged() {
        let payload = json!({
            "id": "evt_2",
            "type": "customer.created",
            "data": { "object": { "id": "cus_1" } }
        })
        .to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let signature = stripe_api::sign_payload("whsec_test", timestamp, payload.as_bytes()).unwrap();
        let header = format!("t={},v1={}", timestamp, signature);

        let response = send(webhook_request(Some(&header), &payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "received": true }));
    }

    #[tokio::test]
    async fn subscription_event_without_a_user_is_acknowledged_as_ignored() {
        let payload = json!({
            "id": "evt_3",
            "type": "customer.subscription.updated",
            "data": { "object": { "id": "sub_1", "status": "active" } }
        })
        .to_string();
        let timestamp = chrono::Utc::now().timestamp();
        let signature = stripe_api::sign_payload("whsec_test", timestamp, payload.as_bytes()).unwrap();
        let header = format!("t={},v1={}", timestamp, signature);

        let response = send(webhook_request(Some(&header), &payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({ "received": true, "ignored": "no_user" })
        );
    }

    #[tokio::test]
    async fn authed_routes_require_a_bearer_token() {
        for (method, uri) in [
            ("POST", "/api/leads/search"),
            ("POST", "/api/session/heartbeat"),
            ("POST", "/api/billing/checkout"),
            ("GET", "/api/billing/status"),
            ("GET", "/api/gmail/connect-url"),
            ("POST", "/api/render"),
        ] {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap();
            let response = send(request).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
        }

        let malformed = Request::builder()
            .method("GET")
            .uri("/api/billing/status")
            .header(header::AUTHORIZATION, "Token abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(malformed).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unsupported_methods_get_405() {
        let request = Request::builder()
            .method("GET")
            .uri("/api/stripe/webhook")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(request).await.status(), StatusCode::METHOD_NOT_ALLOWED);

        let request = Request::builder()
            .method("PUT")
            .uri("/api/track/open")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(request).await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn preflight_gets_permissive_cors() {
        let request = Request::builder()
            .method("OPTIONS")
            .uri("/api/billing/checkout")
            .header(header::ORIGIN, "https://app.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn tracking_pixel_is_always_served() {
        for uri in ["/api/track/open", "/api/track/open?msg=msg-1"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = send(request).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            assert_eq!(&bytes[..], &handlers::tracking::PIXEL_PNG[..]);
        }
    }

    #[tokio::test]
    async fn tracking_pixel_survives_a_malformed_query() {
        let request = Request::builder()
            .uri("/api/track/open?msg=a&msg=b")
            .body(Body::empty())
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], &handlers::tracking::PIXEL_PNG[..]);
    }

    #[tokio::test]
    async fn oauth_callback_requires_code_and_state() {
        let request = Request::builder()
            .uri("/api/gmail/callback?state=user-1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(request).await.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .uri("/api/gmail/callback?code=abc")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(request).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn denied_consent_redirects_back_to_settings() {
        let request = Request::builder()
            .uri("/api/gmail/callback?error=access_denied&state=user-1")
            .body(Body::empty())
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://app.test/settings?error=access_denied"
        );
    }

    #[tokio::test]
    async fn push_without_vapid_keys_is_a_server_error() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/push/send")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "subscription": {
                        "endpoint": "https://push.example/abc",
                        "keys": { "p256dh": "AAAA", "auth": "AAAA" }
                    },
                    "payload": { "title": "hi" }
                })
                .to_string(),
            ))
            .unwrap();
        assert_eq!(
            send(request).await.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn push_without_subscription_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/push/send")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "payload": "hi" }).to_string()))
            .unwrap();
        assert_eq!(send(request).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn pwa_assets_are_served() {
        for (uri, content_type) in [
            ("/manifest.webmanifest", "application/manifest+json"),
            ("/sw.js", "application/javascript; charset=utf-8"),
            ("/offline.html", "text/html; charset=utf-8"),
        ] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = send(request).await;
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
            assert_eq!(response.headers()[header::CONTENT_TYPE], content_type);
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let request = Request::builder()
            .uri("/api/nope")
            .body(Body::empty())
            .unwrap();
        let response = send(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["error"], "Not Found");
    }
}
