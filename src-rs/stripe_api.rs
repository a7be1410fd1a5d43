use std::collections::HashMap;

use anyhow::{anyhow, Context};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{de::DeserializeOwned, Deserialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct StripeApi {
    http: reqwest::Client,
    secret_key: Option<String>,
    webhook_secret: Option<String>,
    base_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("STRIPE_WEBHOOK_SECRET is not configured.")]
    NotConfigured,
    #[error("{0}")]
    Invalid(&'static str),
}

impl StripeApi {
    pub fn new(secret_key: Option<String>, webhook_secret: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create Stripe HTTP client")?;

        Ok(Self {
            http,
            secret_key,
            webhook_secret,
            base_url: "https://api.stripe.com/v1".to_string(),
        })
    }

    pub fn verify_webhook_signature(
        &self,
        signature_header: &str,
        payload: &[u8],
    ) -> Result<(), SignatureError> {
        self.verify_webhook_signature_at(signature_header, payload, Utc::now().timestamp())
    }

    pub fn verify_webhook_signature_at(
        &self,
        signature_header: &str,
        payload: &[u8],
        now: i64,
    ) -> Result<(), SignatureError> {
        let webhook_secret = self
            .webhook_secret
            .as_ref()
            .ok_or(SignatureError::NotConfigured)?;

        let mut timestamp: Option<i64> = None;
        let mut v1_signatures: Vec<&str> = Vec::new();

        for part in signature_header.split(',') {
            let mut pieces = part.trim().splitn(2, '=');
            let key = pieces.next().unwrap_or_default();
            let value = pieces.next().unwrap_or_default();
            if key == "t" {
                timestamp = value.parse::<i64>().ok();
            } else if key == "v1" {
                v1_signatures.push(value);
            }
        }

        let timestamp =
            timestamp.ok_or(SignatureError::Invalid("Missing Stripe timestamp in signature."))?;
        if v1_signatures.is_empty() {
            return Err(SignatureError::Invalid("Missing Stripe v1 signature."));
        }

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(SignatureError::Invalid(
                "Stripe signature timestamp outside tolerance.",
            ));
        }

        let expected = sign_payload(webhook_secret, timestamp, payload)
            .map_err(|_| SignatureError::Invalid("invalid Stripe webhook secret"))?;

        let is_match = v1_signatures
            .into_iter()
            .any(|candidate| expected.as_bytes().ct_eq(candidate.as_bytes()).into());

        if !is_match {
            return Err(SignatureError::Invalid("Invalid Stripe signature."));
        }

        Ok(())
    }

    pub async fn create_customer(
        &self,
        email: Option<&str>,
        user_id: &str,
    ) -> anyhow::Result<StripeCustomer> {
        let mut params = vec![("metadata[user_id]".to_string(), user_id.to_string())];
        if let Some(email) = email {
            params.push(("email".to_string(), email.to_string()));
        }
        self.post_form("customers", &params).await
    }

    pub async fn create_checkout_session(
        &self,
        checkout: &CheckoutParams<'_>,
    ) -> anyhow::Result<StripeCheckoutSession> {
        let params = vec![
            ("customer".to_string(), checkout.customer_id.to_string()),
            ("client_reference_id".to_string(), checkout.user_id.to_string()),
            ("line_items[0][price]".to_string(), checkout.price_id.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            ("mode".to_string(), "subscription".to_string()),
            ("success_url".to_string(), checkout.success_url.to_string()),
            ("cancel_url".to_string(), checkout.cancel_url.to_string()),
            ("metadata[user_id]".to_string(), checkout.user_id.to_string()),
            ("metadata[plan]".to_string(), checkout.plan.to_string()),
            (
                "subscription_data[metadata][user_id]".to_string(),
                checkout.user_id.to_string(),
            ),
            (
                "subscription_data[metadata][plan]".to_string(),
                checkout.plan.to_string(),
            ),
        ];

        self.post_form("checkout/sessions", &params).await
    }

    pub async fn create_billing_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> anyhow::Result<StripeBillingPortalSession> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("return_url".to_string(), return_url.to_string()),
        ];

        self.post_form("billing_portal/sessions", &params).await
    }

    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> anyhow::Result<StripeSubscription> {
        self.get_json(&format!("subscriptions/{}", subscription_id), &[])
            .await
    }

    /// New subscription left incomplete until the client confirms payment.
    pub async fn create_incomplete_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        user_id: &str,
        plan: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![
            ("customer".to_string(), customer_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("payment_behavior".to_string(), "default_incomplete".to_string()),
            (
                "payment_settings[save_default_payment_method]".to_string(),
                "on_subscription".to_string(),
            ),
            ("expand[0]".to_string(), "latest_invoice.payment_intent".to_string()),
            ("metadata[user_id]".to_string(), user_id.to_string()),
            ("metadata[plan]".to_string(), plan.to_string()),
        ];

        self.post_form("subscriptions", &params).await
    }

    /// Swaps the price on an existing subscription with proration.
    pub async fn update_subscription_price(
        &self,
        subscription_id: &str,
        item_id: &str,
        price_id: &str,
        user_id: &str,
        plan: &str,
    ) -> anyhow::Result<StripeSubscription> {
        let params = vec![
            ("items[0][id]".to_string(), item_id.to_string()),
            ("items[0][price]".to_string(), price_id.to_string()),
            ("proration_behavior".to_string(), "create_prorations".to_string()),
            ("payment_behavior".to_string(), "default_incomplete".to_string()),
            ("expand[0]".to_string(), "latest_invoice.payment_intent".to_string()),
            ("metadata[user_id]".to_string(), user_id.to_string()),
            ("metadata[plan]".to_string(), plan.to_string()),
        ];

        self.post_form(&format!("subscriptions/{}", subscription_id), &params)
            .await
    }

    pub async fn retrieve_invoice(&self, invoice_id: &str) -> anyhow::Result<StripeInvoice> {
        self.get_json(&format!("invoices/{}", invoice_id), &[]).await
    }

    fn require_secret_key(&self) -> anyhow::Result<&str> {
        self.secret_key
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow!("STRIPE_SECRET_KEY is not configured."))
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .post(url)
            .bearer_auth(key)
            .form(params)
            .send()
            .await
            .with_context(|| format!("Stripe POST failed for {}", path))?;

        parse_stripe_response(response, path).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<T> {
        let key = self.require_secret_key()?;
        let url = format!("{}/{}", self.base_url, path);

        let response = self
            .http
            .get(url)
            .bearer_auth(key)
            .query(query)
            .send()
            .await
            .with_context(|| format!("Stripe GET failed for {}", path))?;

        parse_stripe_response(response, path).await
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`, the v1 scheme.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> anyhow::Result<String> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).context("invalid Stripe webhook secret")?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

async fn parse_stripe_response<T: DeserializeOwned>(
    response: reqwest::Response,
    path: &str,
) -> anyhow::Result<T> {
    let status = response.status();
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read Stripe response body for {}", path))?;

    if !status.is_success() {
        return Err(anyhow!(
            "Stripe API {} failed with status {}: {}",
            path,
            status,
            text
        ));
    }

    serde_json::from_str::<T>(&text)
        .with_context(|| format!("failed to decode Stripe response for {}", path))
}

pub struct CheckoutParams<'a> {
    pub customer_id: &'a str,
    pub price_id: &'a str,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
    pub user_id: &'a str,
    pub plan: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeCheckoutSession {
    pub url: Option<String>,
    pub customer: Option<IdOrObject>,
    pub subscription: Option<IdOrObject>,
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeBillingPortalSession {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: Option<IdOrObject>,
    pub status: Option<String>,
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub items: StripeSubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub latest_invoice: Option<InvoiceRef>,
}

impl StripeSubscription {
    pub fn first_item(&self) -> Option<&StripeSubscriptionItem> {
        self.items.data.first()
    }

    pub fn price_id(&self) -> Option<&str> {
        self.first_item()
            .and_then(|item| item.price.as_ref())
            .and_then(|price| price.id.as_deref())
    }

    /// Newer API versions report the period on the item instead.
    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|item| item.current_period_end))
    }

    pub fn payment_intent_client_secret(&self) -> Option<String> {
        match self.latest_invoice.as_ref()? {
            InvoiceRef::Object(invoice) => match invoice.payment_intent.as_ref()? {
                PaymentIntentRef::Object { client_secret } => client_secret.clone(),
                PaymentIntentRef::Id(id) => {
                    tracing::debug!(payment_intent = %id, "payment intent was not expanded");
                    None
                }
            },
            InvoiceRef::Id(id) => {
                tracing::debug!(invoice = %id, "latest invoice was not expanded");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StripeSubscriptionItems {
    #[serde(default)]
    pub data: Vec<StripeSubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeSubscriptionItem {
    pub id: Option<String>,
    pub price: Option<StripePrice>,
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePrice {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeInvoice {
    pub subscription: Option<IdOrObject>,
    pub payment_intent: Option<PaymentIntentRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InvoiceRef {
    Id(String),
    Object(Box<StripeInvoice>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PaymentIntentRef {
    Id(String),
    Object { client_secret: Option<String> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripePaymentIntent {
    pub invoice: Option<IdOrObject>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdOrObject {
    Id(String),
    Object { id: String },
}

impl IdOrObject {
    pub fn id(&self) -> &str {
        match self {
            IdOrObject::Id(value) => value,
            IdOrObject::Object { id } => id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api() -> StripeApi {
        StripeApi::new(Some("sk_test".to_string()), Some("whsec_test".to_string())).unwrap()
    }

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let signature = sign_payload("whsec_test", 1_700_000_000, payload).unwrap();
        let header = format!("t=1700000000,v1=deadbeef,v1={}", signature);

        assert!(api()
            .verify_webhook_signature_at(&header, payload, 1_700_000_010)
            .is_ok());
    }

    #[test]
    fn tampered_or_stale_signatures_are_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let signature = sign_payload("whsec_test", 1_700_000_000, payload).unwrap();
        let header = format!("t=1700000000,v1={}", signature);

        let tampered = api().verify_webhook_signature_at(&header, br#"{"id":"evt_2"}"#, 1_700_000_000);
        assert!(matches!(tampered, Err(SignatureError::Invalid(_))));

        let stale = api().verify_webhook_signature_at(&header, payload, 1_700_000_000 + 301);
        assert!(matches!(stale, Err(SignatureError::Invalid(_))));

        let missing = api().verify_webhook_signature_at("v1=abc", payload, 1_700_000_000);
        assert!(matches!(missing, Err(SignatureError::Invalid(_))));
    }

    #[test]
    fn missing_secret_is_a_configuration_error() {
        let api = StripeApi::new(None, None).unwrap();
        let result = api.verify_webhook_signature_at("t=1,v1=abc", b"{}", 1);
        assert!(matches!(result, Err(SignatureError::NotConfigured)));
    }

    #[test]
    fn subscription_exposes_price_period_and_client_secret() {
        let subscription: StripeSubscription = serde_json::from_value(json!({
            "id": "sub_1",
            "customer": "cus_1",
            "status": "incomplete",
            "items": { "data": [{ "id": "si_1", "price": { "id": "price_studio" }, "current_period_end": 1_800_000_000 }] },
            "latest_invoice": {
                "id": "in_1",
                "payment_intent": { "id": "pi_1", "client_secret": "pi_1_secret" }
            }
        }))
        .unwrap();

        assert_eq!(subscription.price_id(), Some("price_studio"));
        assert_eq!(subscription.period_end(), Some(1_800_000_000));
        assert_eq!(
            subscription.payment_intent_client_secret().as_deref(),
            Some("pi_1_secret")
        );
        assert_eq!(subscription.customer.as_ref().map(IdOrObject::id), Some("cus_1"));
    }

    #[test]
    fn unexpanded_invoice_yields_no_client_secret() {
        let subscription: StripeSubscription = serde_json::from_value(json!({
            "id": "sub_1",
            "latest_invoice": "in_1"
        }))
        .unwrap();
        assert_eq!(subscription.payment_intent_client_secret(), None);
    }
}
