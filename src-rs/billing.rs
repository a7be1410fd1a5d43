use anyhow::Context;

use crate::{
    models::{Profile, ProfileBillingUpsert, ProfileCustomerUpsert, PROFILES},
    plans::{derive_plan_status, PriceMap},
    store::{eq, StoreClient},
    stripe_api::{
        StripeApi, StripeCheckoutSession, StripeEvent, StripeInvoice, StripePaymentIntent,
        StripeSubscription,
    },
};

/// Processor events this service acts on. Everything else is acknowledged
/// and dropped.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted(StripeCheckoutSession),
    SubscriptionChanged(StripeSubscription),
    InvoicePaid(StripeInvoice),
    PaymentIntentSucceeded(StripePaymentIntent),
    Unhandled(String),
}

impl BillingEvent {
    pub fn from_event(event: StripeEvent) -> anyhow::Result<Self> {
        let object = event.data.object;
        let parsed = match event.event_type.as_str() {
            "checkout.session.completed" => BillingEvent::CheckoutCompleted(
                serde_json::from_value(object).context("failed to decode checkout session")?,
            ),
            "customer.subscription.created"
            | "customer.subscription.updated"
            | "customer.subscription.deleted" => BillingEvent::SubscriptionChanged(
                serde_json::from_value(object).context("failed to decode subscription object")?,
            ),
            "invoice.payment_succeeded" => BillingEvent::InvoicePaid(
                serde_json::from_value(object).context("failed to decode invoice object")?,
            ),
            "payment_intent.succeeded" => BillingEvent::PaymentIntentSucceeded(
                serde_json::from_value(object).context("failed to decode payment intent")?,
            ),
            other => BillingEvent::Unhandled(other.to_string()),
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied { user_id: String },
    /// The event could not be tied to a user. Nothing was written.
    NoUser,
    Ignored,
}

pub struct Reconciler<'a> {
    pub stripe: &'a StripeApi,
    pub store: &'a StoreClient,
    pub prices: &'a PriceMap,
}

impl Reconciler<'_> {
    pub async fn apply(&self, event: BillingEvent) -> anyhow::Result<ReconcileOutcome> {
        match event {
            BillingEvent::CheckoutCompleted(session) => self.apply_checkout(session).await,
            BillingEvent::SubscriptionChanged(subscription) => {
                self.apply_subscription(&subscription).await
            }
            BillingEvent::InvoicePaid(invoice) => match invoice.subscription {
                Some(subscription) => self.refetch_and_apply(subscription.id()).await,
                None => Ok(ReconcileOutcome::Ignored),
            },
            BillingEvent::PaymentIntentSucceeded(intent) => {
                match self.subscription_for_payment_intent(&intent).await? {
                    Some(subscription_id) => self.refetch_and_apply(&subscription_id).await,
                    None => Ok(ReconcileOutcome::Ignored),
                }
            }
            BillingEvent::Unhandled(kind) => {
                tracing::debug!(event_type = %kind, "ignoring billing event");
                Ok(ReconcileOutcome::Ignored)
            }
        }
    }

    async fn apply_checkout(
        &self,
        session: StripeCheckoutSession,
    ) -> anyhow::Result<ReconcileOutcome> {
        let subscription = match session.subscription.as_ref() {
            Some(reference) => Some(
                self.stripe
                    .retrieve_subscription(reference.id())
                    .await
                    .context("failed to load subscription for checkout session")?,
            ),
            None => None,
        };

        let Some(user_id) = checkout_user_id(&session, subscription.as_ref()) else {
            return Ok(ReconcileOutcome::NoUser);
        };

        let update = profile_from_checkout(self.prices, &user_id, &session, subscription.as_ref());
        self.write(update).await
    }

    async fn apply_subscription(
        &self,
        subscription: &StripeSubscription,
    ) -> anyhow::Result<ReconcileOutcome> {
        let Some(user_id) = metadata_user_id(&subscription.metadata) else {
            return Ok(ReconcileOutcome::NoUser);
        };

        let update = profile_from_subscription(self.prices, &user_id, subscription);
        self.write(update).await
    }

    async fn refetch_and_apply(&self, subscription_id: &str) -> anyhow::Result<ReconcileOutcome> {
        let subscription = self
            .stripe
            .retrieve_subscription(subscription_id)
            .await
            .context("failed to re-fetch subscription")?;
        self.apply_subscription(&subscription).await
    }

    async fn subscription_for_payment_intent(
        &self,
        intent: &StripePaymentIntent,
    ) -> anyhow::Result<Option<String>> {
        if let Some(invoice) = intent.invoice.as_ref() {
            let invoice = self
                .stripe
                .retrieve_invoice(invoice.id())
                .await
                .context("failed to load invoice for payment intent")?;
            if let Some(subscription) = invoice.subscription {
                return Ok(Some(subscription.id().to_string()));
            }
        }

        Ok(intent
            .metadata
            .get("subscription_id")
            .filter(|value| !value.trim().is_empty())
            .cloned())
    }

    async fn write(&self, update: ProfileBillingUpsert) -> anyhow::Result<ReconcileOutcome> {
        self.store
            .upsert(PROFILES, "id", &update)
            .await
            .with_context(|| format!("failed to upsert billing profile for {}", update.id))?;

        tracing::info!(
            user_id = %update.id,
            plan = ?update.plan,
            status = %update.plan_status,
            "billing profile reconciled"
        );
        Ok(ReconcileOutcome::Applied { user_id: update.id })
    }
}

pub async fn load_profile(store: &StoreClient, user_id: &str) -> anyhow::Result<Option<Profile>> {
    store
        .select_one(PROFILES, &[("id", eq(user_id))])
        .await
        .with_context(|| format!("failed to load profile for {user_id}"))
}

/// Returns the processor customer stored on `profile`, creating one and
/// persisting its id on first use.
pub async fn ensure_customer(
    stripe: &StripeApi,
    store: &StoreClient,
    user_id: &str,
    email: Option<&str>,
    profile: Option<&Profile>,
) -> anyhow::Result<String> {
    if let Some(customer_id) = profile
        .and_then(|profile| profile.stripe_customer_id.as_deref())
        .filter(|value| !value.trim().is_empty())
    {
        return Ok(customer_id.to_string());
    }

    let customer = stripe
        .create_customer(email, user_id)
        .await
        .context("failed to create Stripe customer")?;

    store
        .upsert(
            PROFILES,
            "id",
            &ProfileCustomerUpsert {
                id: user_id,
                stripe_customer_id: &customer.id,
            },
        )
        .await
        .context("failed to persist Stripe customer id")?;

    tracing::info!(user_id = %user_id, customer_id = %customer.id, "created Stripe customer");
    Ok(customer.id)
}

fn metadata_user_id(metadata: &std::collections::HashMap<String, String>) -> Option<String> {
    metadata
        .get("user_id")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn checkout_user_id(
    session: &StripeCheckoutSession,
    subscription: Option<&StripeSubscription>,
) -> Option<String> {
    metadata_user_id(&session.metadata)
        .or_else(|| {
            session
                .client_reference_id
                .as_ref()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
        .or_else(|| subscription.and_then(|subscription| metadata_user_id(&subscription.metadata)))
}

pub fn profile_from_subscription(
    prices: &PriceMap,
    user_id: &str,
    subscription: &StripeSubscription,
) -> ProfileBillingUpsert {
    let plan = prices.resolve_plan(
        subscription.price_id(),
        subscription.metadata.get("plan").map(String::as_str),
    );

    ProfileBillingUpsert {
        id: user_id.to_string(),
        plan: plan.map(|plan| plan.as_str().to_string()),
        stripe_customer_id: subscription
            .customer
            .as_ref()
            .map(|customer| customer.id().to_string()),
        stripe_subscription_id: Some(subscription.id.clone()),
        plan_status: derive_plan_status(subscription.status.as_deref()),
        current_period_end: subscription.period_end(),
        cancel_at_period_end: subscription.cancel_at_period_end.unwrap_or(false),
    }
}

pub fn profile_from_checkout(
    prices: &PriceMap,
    user_id: &str,
    session: &StripeCheckoutSession,
    subscription: Option<&StripeSubscription>,
) -> ProfileBillingUpsert {
    if let Some(subscription) = subscription {
        let mut update = profile_from_subscription(prices, user_id, subscription);
        if update.plan.is_none() {
            update.plan = prices
                .resolve_plan(None, session.metadata.get("plan").map(String::as_str))
                .map(|plan| plan.as_str().to_string());
        }
        if update.stripe_customer_id.is_none() {
            update.stripe_customer_id = session
                .customer
                .as_ref()
                .map(|customer| customer.id().to_string());
        }
        return update;
    }

    let plan = prices.resolve_plan(None, session.metadata.get("plan").map(String::as_str));
    ProfileBillingUpsert {
        id: user_id.to_string(),
        plan: plan.map(|plan| plan.as_str().to_string()),
        stripe_customer_id: session
            .customer
            .as_ref()
            .map(|customer| customer.id().to_string()),
        stripe_subscription_id: None,
        plan_status: derive_plan_status(None),
        current_period_end: None,
        cancel_at_period_end: false,
    }
}
