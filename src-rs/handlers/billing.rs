use anyhow::anyhow;
use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Extension, Json, State},
    http::HeaderMap,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    billing::{ensure_customer, load_profile, BillingEvent, ReconcileOutcome, Reconciler},
    error::{AppError, AppResult},
    handlers::parse_body,
    middleware::AuthenticatedUser,
    models::Profile,
    plans::{effective_plan, plan_from_metadata, plan_limits, PlanId, PriceMap},
    state::AppState,
    stripe_api::{CheckoutParams, SignatureError, StripeEvent},
};

#[derive(Debug, Default, Deserialize)]
pub struct CheckoutRequest {
    pub plan: Option<String>,
    #[serde(alias = "priceId")]
    pub price_id: Option<String>,
    #[serde(alias = "successUrl")]
    pub success_url: Option<String>,
    #[serde(alias = "cancelUrl")]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PortalRequest {
    #[serde(alias = "returnUrl")]
    pub return_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubscribeRequest {
    pub plan: Option<String>,
    #[serde(alias = "priceId")]
    pub price_id: Option<String>,
}

/// Resolves the plan and price a checkout or subscribe call is for. An
/// explicit price wins; otherwise the plan's configured price is used.
pub fn resolve_price(
    prices: &PriceMap,
    plan: Option<&str>,
    price_id: Option<&str>,
) -> AppResult<(PlanId, String)> {
    let requested_plan = plan_from_metadata(plan);

    if let Some(price_id) = price_id.map(str::trim).filter(|value| !value.is_empty()) {
        let plan = prices
            .get_plan_for_price_id(Some(price_id))
            .or(requested_plan)
            .unwrap_or(PlanId::Starter);
        return Ok((plan, price_id.to_string()));
    }

    let plan = requested_plan
        .ok_or_else(|| AppError::bad_request("A plan or priceId is required."))?;
    let price_id = prices
        .price_for_plan(plan)
        .ok_or_else(|| AppError::bad_request(format!("No price is configured for plan {}.", plan.as_str())))?;
    Ok((plan, price_id.to_string()))
}

fn ensure_plan_allowed(plan: PlanId, profile: Option<&Profile>) -> AppResult<()> {
    if plan.requires_approval() && !profile.map(|profile| profile.agency_approved).unwrap_or(false) {
        return Err(AppError::forbidden(
            "This plan is invite-only. Join the waitlist to request access.",
        ));
    }
    Ok(())
}

pub async fn create_checkout_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let body = parse_body(payload)?;
    let (plan, price_id) = resolve_price(
        &state.price_map,
        body.plan.as_deref(),
        body.price_id.as_deref(),
    )?;

    let profile = load_profile(&state.store, &user.id).await?;
    ensure_plan_allowed(plan, profile.as_ref())?;

    let customer_id = ensure_customer(
        &state.stripe,
        &state.store,
        &user.id,
        user.email.as_deref(),
        profile.as_ref(),
    )
    .await?;

    let app_url = &state.config.app_url;
    let success_url = body
        .success_url
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{}/billing?checkout=success", app_url));
    let cancel_url = body
        .cancel_url
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{}/billing?checkout=cancelled", app_url));

    let session = state
        .stripe
        .create_checkout_session(&CheckoutParams {
            customer_id: &customer_id,
            price_id: &price_id,
            success_url: &success_url,
            cancel_url: &cancel_url,
            user_id: &user.id,
            plan: plan.as_str(),
        })
        .await?;

    let url = session
        .url
        .ok_or_else(|| anyhow!("Stripe checkout session has no URL"))?;
    Ok(Json(json!({ "url": url })))
}

pub async fn create_portal_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let body: PortalRequest = if body.is_empty() {
        PortalRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|error| AppError::bad_request(format!("Invalid JSON body: {error}")))?
    };
    let profile = load_profile(&state.store, &user.id).await?;
    let customer_id = ensure_customer(
        &state.stripe,
        &state.store,
        &user.id,
        user.email.as_deref(),
        profile.as_ref(),
    )
    .await?;

    let return_url = body
        .return_url
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| format!("{}/settings/billing", state.config.app_url));

    let session = state
        .stripe
        .create_billing_portal_session(&customer_id, &return_url)
        .await?;

    let url = session
        .url
        .ok_or_else(|| anyhow!("Stripe portal session has no URL"))?;
    Ok(Json(json!({ "url": url })))
}

/// In-app payment collection. Moves an existing live subscription to the new
/// price, or opens an incomplete one, and hands back the client secret.
pub async fn create_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let body = parse_body(payload)?;
    let (plan, price_id) = resolve_price(
        &state.price_map,
        body.plan.as_deref(),
        body.price_id.as_deref(),
    )?;

    let profile = load_profile(&state.store, &user.id).await?;
    ensure_plan_allowed(plan, profile.as_ref())?;

    let customer_id = ensure_customer(
        &state.stripe,
        &state.store,
        &user.id,
        user.email.as_deref(),
        profile.as_ref(),
    )
    .await?;

    let existing = match profile
        .as_ref()
        .and_then(|profile| profile.stripe_subscription_id.as_deref())
    {
        Some(subscription_id) => Some(state.stripe.retrieve_subscription(subscription_id).await?),
        None => None,
    };

    let live_item = existing.as_ref().and_then(|subscription| {
        let terminal = matches!(
            subscription.status.as_deref(),
            Some("canceled") | Some("incomplete_expired")
        );
        let item_id = subscription.first_item().and_then(|item| item.id.clone());
        (!terminal).then_some(item_id).flatten().map(|item| (subscription.id.clone(), item))
    });

    let subscription = match live_item {
        Some((subscription_id, item_id)) => {
            state
                .stripe
                .update_subscription_price(&subscription_id, &item_id, &price_id, &user.id, plan.as_str())
                .await?
        }
        None => {
            state
                .stripe
                .create_incomplete_subscription(&customer_id, &price_id, &user.id, plan.as_str())
                .await?
        }
    };

    let client_secret = subscription
        .payment_intent_client_secret()
        .ok_or_else(|| anyhow!("subscription {} produced no payment intent", subscription.id))?;

    Ok(Json(json!({
        "subscriptionId": subscription.id,
        "clientSecret": client_secret,
        "status": subscription.status,
        "plan": plan.as_str(),
    })))
}

pub async fn billing_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> AppResult<Json<Value>> {
    let profile = load_profile(&state.store, &user.id).await?.unwrap_or_default();
    let plan = effective_plan(profile.plan.as_deref(), profile.plan_status.as_deref());

    Ok(Json(json!({
        "plan": plan.as_str(),
        "storedPlan": profile.plan,
        "status": profile.plan_status,
        "currentPeriodEnd": profile.current_period_end,
        "cancelAtPeriodEnd": profile.cancel_at_period_end,
        "senderSeatsUsed": profile.sender_seats_used,
        "limits": plan_limits(plan),
    })))
}

pub async fn handle_stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::bad_request("Missing Stripe signature."))?;

    match state.stripe.verify_webhook_signature(signature, &body) {
        Ok(()) => {}
        Err(SignatureError::NotConfigured) => {
            return Err(AppError::Internal(anyhow!("Webhook not configured.")));
        }
        Err(error) => {
            tracing::warn!(error = %error, "Stripe webhook signature verification failed");
            return Err(AppError::bad_request("Invalid signature."));
        }
    }

    let event: StripeEvent = serde_json::from_slice(&body).map_err(|error| {
        tracing::error!(error = %error, "invalid Stripe webhook payload");
        AppError::bad_request("Invalid event payload.")
    })?;

    let event_id = event.id.clone();
    let event_type = event.event_type.clone();
    let billing_event = BillingEvent::from_event(event)?;

    let reconciler = Reconciler {
        stripe: &state.stripe,
        store: &state.store,
        prices: &state.price_map,
    };

    match reconciler.apply(billing_event).await? {
        ReconcileOutcome::NoUser => {
            tracing::warn!(
                event_id = %event_id,
                event_type = %event_type,
                "Stripe webhook: no user could be resolved, nothing written"
            );
            Ok(Json(json!({ "received": true, "ignored": "no_user" })))
        }
        ReconcileOutcome::Applied { user_id } => {
            tracing::debug!(event_id = %event_id, user_id = %user_id, "Stripe webhook applied");
            Ok(Json(json!({ "received": true })))
        }
        ReconcileOutcome::Ignored => Ok(Json(json!({ "received": true }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn prices() -> PriceMap {
        PriceMap::from_config(&Config::test_default())
    }

    #[test]
    fn plan_name_resolves_to_configured_price() {
        let (plan, price) = resolve_price(&prices(), Some("studio"), None).unwrap();
        assert_eq!(plan, PlanId::Studio);
        assert_eq!(price, "price_studio");
    }

    #[test]
    fn explicit_price_wins() {
        let (plan, price) = resolve_price(&prices(), Some("studio"), Some("price_agency")).unwrap();
        assert_eq!(plan, PlanId::AgencyWaitlist);
        assert_eq!(price, "price_agency");

        let (plan, price) = resolve_price(&prices(), Some("studio"), Some("price_promo")).unwrap();
        assert_eq!(plan, PlanId::Studio);
        assert_eq!(price, "price_promo");
    }

    #[test]
    fn unpriced_plans_are_bad_requests() {
        assert!(matches!(
            resolve_price(&prices(), Some("starter"), None),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            resolve_price(&prices(), None, None),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn agency_requires_approval() {
        assert!(matches!(
            ensure_plan_allowed(PlanId::AgencyWaitlist, None),
            Err(AppError::Forbidden(_))
        ));
        let approved = Profile {
            agency_approved: true,
            ..Profile::default()
        };
        assert!(ensure_plan_allowed(PlanId::AgencyWaitlist, Some(&approved)).is_ok());
        assert!(ensure_plan_allowed(PlanId::Studio, None).is_ok());
    }
}
