use axum::{
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::IntoResponse,
};

const MANIFEST: &str = include_str!("../../static/manifest.webmanifest");
const SERVICE_WORKER: &str = include_str!("../../static/sw.js");
const OFFLINE_PAGE: &str = include_str!("../../static/offline.html");

pub async fn manifest() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "application/manifest+json"),
            (CACHE_CONTROL, "public, max-age=3600"),
        ],
        MANIFEST,
    )
}

pub async fn service_worker() -> impl IntoResponse {
    // Browsers must re-check the worker on every navigation.
    (
        [
            (CONTENT_TYPE, "application/javascript; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        SERVICE_WORKER,
    )
}

pub async fn offline_page() -> impl IntoResponse {
    (
        [
            (CONTENT_TYPE, "text/html; charset=utf-8"),
            (CACHE_CONTROL, "public, max-age=3600"),
        ],
        OFFLINE_PAGE,
    )
}
