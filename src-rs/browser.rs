use std::time::Duration;

use anyhow::{anyhow, Context};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::json;

/// Page-load budget handed to the browser.
pub const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for a remote headless browser exposing Browserless-style
/// `/content` and `/screenshot` endpoints.
#[derive(Clone)]
pub struct BrowserClient {
    http: reqwest::Client,
    base_url: Option<String>,
    token: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    /// Base64 PNG of the viewport.
    pub screenshot: String,
}

impl BrowserClient {
    pub fn new(base_url: Option<String>, token: Option<String>) -> anyhow::Result<Self> {
        // Headroom over the page-load budget for the browser to respond.
        let http = reqwest::Client::builder()
            .timeout(PAGE_LOAD_TIMEOUT + Duration::from_secs(10))
            .build()
            .context("failed to create browser HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.map(|value| value.trim_end_matches('/').to_string()),
            token,
        })
    }

    pub async fn render(&self, url: &str) -> anyhow::Result<RenderedPage> {
        let html = self.post("content", url, json!({})).await?;
        let html = decode_html(html);

        let screenshot = self
            .post(
                "screenshot",
                url,
                json!({ "options": { "type": "png", "fullPage": false } }),
            )
            .await?;

        Ok(RenderedPage {
            url: url.to_string(),
            html,
            screenshot: STANDARD.encode(screenshot),
        })
    }

    async fn post(
        &self,
        endpoint: &str,
        url: &str,
        extra: serde_json::Value,
    ) -> anyhow::Result<Vec<u8>> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or_else(|| anyhow!("BROWSERLESS_URL is not configured."))?;

        let mut request = self
            .http
            .post(format!("{}/{}", base_url, endpoint))
            .json(&render_body(url, extra));
        if let Some(token) = self.token.as_deref() {
            request = request.query(&[("token", token)]);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("headless browser {} request failed for {}", endpoint, url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "headless browser {} failed with status {}: {}",
                endpoint,
                status,
                body
            ));
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed to read headless browser {} body", endpoint))?;
        Ok(bytes.to_vec())
    }
}

/// Pages in legacy encodings still get audited; invalid bytes become U+FFFD.
fn decode_html(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|error| String::from_utf8_lossy(error.as_bytes()).into_owned())
}

fn render_body(url: &str, extra: serde_json::Value) -> serde_json::Value {
    let mut body = json!({
        "url": url,
        "gotoOptions": {
            "waitUntil": "networkidle2",
            "timeout": PAGE_LOAD_TIMEOUT.as_millis() as u64,
        },
    });
    if let (Some(target), serde_json::Value::Object(extra)) = (body.as_object_mut(), extra) {
        target.extend(extra);
    }
    body
}

/// Only absolute http(s) URLs are rendered.
pub fn validate_render_url(raw: &str) -> Option<String> {
    let url = reqwest::Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_body_carries_page_load_timeout() {
        let body = render_body("https://example.com", json!({ "options": { "type": "png" } }));
        assert_eq!(body["url"], "https://example.com");
        assert_eq!(body["gotoOptions"]["timeout"], 15_000);
        assert_eq!(body["gotoOptions"]["waitUntil"], "networkidle2");
        assert_eq!(body["options"]["type"], "png");
    }

    #[test]
    fn non_utf8_html_is_decoded_lossily() {
        assert_eq!(decode_html(b"<p>ok</p>".to_vec()), "<p>ok</p>");
        assert_eq!(
            decode_html(b"<p>caf\xe9</p>".to_vec()),
            "<p>caf\u{fffd}</p>"
        );
    }

    #[test]
    fn only_http_urls_are_renderable() {
        assert_eq!(
            validate_render_url(" https://example.com/a ").as_deref(),
            Some("https://example.com/a")
        );
        assert!(validate_render_url("file:///etc/passwd").is_none());
        assert!(validate_render_url("javascript:alert(1)").is_none());
        assert!(validate_render_url("example.com").is_none());
    }

    #[tokio::test]
    async fn unconfigured_browser_fails_without_network() {
        let client = BrowserClient::new(None, None).unwrap();
        let error = client.render("https://example.com").await.unwrap_err();
        assert!(error.to_string().contains("BROWSERLESS_URL"));
    }
}
