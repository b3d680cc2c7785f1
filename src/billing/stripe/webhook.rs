//! Stripe webhook handling.
//!
//! Verifies the `Stripe-Signature` header, deduplicates events and turns
//! subscription events into record transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{META_PLAN, META_TENANT_ID, StripePrices, map_status};
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::plans::PlanId;
use crate::billing::storage::{BillingStore, ProviderKind, SubscriptionStatus};
use crate::billing::subscription::{
    ProviderSubscriptionUpdate, SubscriptionManager, TransitionOutcome,
};
use crate::billing::webhook::{
    WebhookOutcome, check_timestamp, parse_payload, parse_signature_header, verify_signature,
};

/// Verify a `Stripe-Signature` header (`t=...,v1=...`) against the raw body.
///
/// The signed payload is `"{t}.{body}"`; timestamps more than five minutes
/// from `now` are rejected.
pub fn verify_stripe_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: DateTime<Utc>,
) -> BillingResult<()> {
    let (timestamp, signature) = parse_signature_header(header, "t")?;
    check_timestamp(timestamp, now.timestamp())?;

    let mut signed_payload = format!("{}.", timestamp).into_bytes();
    signed_payload.extend_from_slice(payload);
    verify_signature(secret, &signed_payload, &signature)
}

/// Parsed Stripe event envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

/// The subscription fields read from webhook objects.
#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<String>,
    #[serde(default)]
    status: String,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    canceled_at: Option<i64>,
    ended_at: Option<i64>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    items: Option<ItemList>,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    price: Option<Price>,
}

#[derive(Debug, Deserialize)]
struct Price {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    subscription: Option<String>,
    customer: Option<String>,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    subscription: Option<String>,
}

fn from_unix(ts: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0)
}

fn object<T: serde::de::DeserializeOwned>(event: &StripeEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::InvalidWebhookPayload {
            message: format!("invalid {} object: {}", event.event_type, e),
        }
    })
}

/// Webhook handler for Stripe events.
///
/// The webhook secret is stored using [`SecretString`] to prevent accidental
/// exposure in logs or debug output.
pub struct StripeWebhookHandler {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionManager,
    webhook_secret: SecretString,
    prices: StripePrices,
}

impl StripeWebhookHandler {
    #[must_use]
    pub fn new(
        store: Arc<dyn BillingStore>,
        webhook_secret: SecretString,
        prices: StripePrices,
    ) -> Self {
        Self {
            subscriptions: SubscriptionManager::new(store.clone()),
            store,
            webhook_secret,
            prices,
        }
    }

    /// Verify the signature and parse the event.
    pub fn verify_event(
        &self,
        payload: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<StripeEvent> {
        verify_stripe_signature(self.webhook_secret.expose_secret(), payload, signature, now)?;
        parse_payload(payload)
    }

    /// Verify and process a raw webhook delivery.
    pub async fn process(&self, payload: &[u8], signature: &str) -> BillingResult<WebhookOutcome> {
        let now = Utc::now();
        let event = self.verify_event(payload, signature, now)?;
        self.handle_event(event, now).await
    }

    /// Process a verified event.
    pub async fn handle_event(
        &self,
        event: StripeEvent,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        if self
            .store
            .is_event_processed(ProviderKind::Stripe, &event.id)
            .await?
        {
            tracing::debug!(
                target: "clinify::billing::stripe",
                event_id = %event.id,
                "Skipping already processed event"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" => self.handle_checkout_completed(&event, now).await?,
            "customer.subscription.created" | "customer.subscription.updated" => {
                self.handle_subscription_changed(&event, None, now).await?
            }
            "customer.subscription.deleted" => {
                self.handle_subscription_changed(&event, Some(SubscriptionStatus::Canceled), now)
                    .await?
            }
            "invoice.paid" => {
                self.handle_invoice(&event, &[SubscriptionStatus::PastDue], SubscriptionStatus::Active, now)
                    .await?
            }
            "invoice.payment_failed" => {
                self.handle_invoice(
                    &event,
                    &[SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                    SubscriptionStatus::PastDue,
                    now,
                )
                .await?
            }
            _ => WebhookOutcome::Ignored,
        };

        if outcome == WebhookOutcome::Processed {
            self.store
                .mark_event_processed(ProviderKind::Stripe, &event.id)
                .await?;
        }

        tracing::info!(
            target: "clinify::billing::stripe",
            event_id = %event.id,
            event_type = %event.event_type,
            outcome = ?outcome,
            "Handled Stripe webhook"
        );

        Ok(outcome)
    }

    async fn handle_checkout_completed(
        &self,
        event: &StripeEvent,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        let session: CheckoutSessionObject = object(event)?;

        // Not a subscription checkout.
        let Some(subscription_id) = session.subscription else {
            return Ok(WebhookOutcome::Ignored);
        };

        let Some(tenant_id) = session
            .metadata
            .get(META_TENANT_ID)
            .cloned()
            .or(session.client_reference_id)
        else {
            tracing::warn!(
                target: "clinify::billing::stripe",
                event_id = %event.id,
                "Checkout session has no tenant reference"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let mut update = ProviderSubscriptionUpdate::new(
            tenant_id,
            ProviderKind::Stripe,
            subscription_id,
            SubscriptionStatus::Active,
        );
        if let Some(plan) = session.metadata.get(META_PLAN).and_then(|p| p.parse::<PlanId>().ok()) {
            update = update.plan(plan);
        }
        if let Some(customer_id) = session.customer {
            update = update.customer_id(customer_id);
        }

        self.apply(update, now).await
    }

    async fn handle_subscription_changed(
        &self,
        event: &StripeEvent,
        forced_status: Option<SubscriptionStatus>,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        let sub: SubscriptionObject = object(event)?;

        let tenant_id = match sub.metadata.get(META_TENANT_ID) {
            Some(tenant_id) => Some(tenant_id.clone()),
            None => match sub.customer.as_deref() {
                Some(customer_id) => self
                    .store
                    .find_by_customer_id(ProviderKind::Stripe, customer_id)
                    .await?
                    .map(|s| s.tenant_id),
                None => None,
            },
        };
        let Some(tenant_id) = tenant_id else {
            tracing::warn!(
                target: "clinify::billing::stripe",
                event_id = %event.id,
                subscription_id = %sub.id,
                "Subscription event for unknown tenant"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let status = forced_status.unwrap_or_else(|| map_status(&sub.status));
        let plan = sub
            .metadata
            .get(META_PLAN)
            .and_then(|p| p.parse::<PlanId>().ok())
            .or_else(|| {
                sub.items
                    .as_ref()
                    .and_then(|items| items.data.first())
                    .and_then(|item| item.price.as_ref())
                    .and_then(|price| self.prices.plan_for_price(&price.id))
            });

        let mut update =
            ProviderSubscriptionUpdate::new(tenant_id, ProviderKind::Stripe, sub.id, status)
                .cancel_at_period_end(sub.cancel_at_period_end);
        if let Some(plan) = plan {
            update = update.plan(plan);
        }
        if let Some(customer_id) = sub.customer {
            update = update.customer_id(customer_id);
        }
        if let Some(period_end) = sub.current_period_end.and_then(from_unix) {
            update = update.period_end(period_end);
        }
        update.canceled_at = sub.canceled_at.or(sub.ended_at).and_then(from_unix);

        self.apply(update, now).await
    }

    async fn handle_invoice(
        &self,
        event: &StripeEvent,
        expected: &[SubscriptionStatus],
        next: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        let invoice: InvoiceObject = object(event)?;
        let Some(subscription_id) = invoice.subscription else {
            return Ok(WebhookOutcome::Ignored);
        };

        for from in expected {
            if self
                .subscriptions
                .transition_linked(ProviderKind::Stripe, &subscription_id, *from, next, now)
                .await?
                .is_some()
            {
                return Ok(WebhookOutcome::Processed);
            }
        }

        Ok(WebhookOutcome::Ignored)
    }

    async fn apply(
        &self,
        update: ProviderSubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        match self.subscriptions.apply_provider_update(update, now).await? {
            TransitionOutcome::Applied(_) => Ok(WebhookOutcome::Processed),
            TransitionOutcome::Rejected { .. } => Ok(WebhookOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::webhook::compute_signature;
    use serde_json::json;

    const SECRET: &str = "whsec_test_secret";

    fn handler() -> (InMemoryBillingStore, StripeWebhookHandler) {
        let store = InMemoryBillingStore::new();
        let handler = StripeWebhookHandler::new(
            Arc::new(store.clone()),
            SecretString::from(SECRET.to_string()),
            StripePrices::new()
                .with_price(PlanId::Basic, "price_basic")
                .with_price(PlanId::Professional, "price_pro"),
        );
        (store, handler)
    }

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut signed = format!("{}.", timestamp).into_bytes();
        signed.extend_from_slice(payload);
        format!("t={},v1={}", timestamp, compute_signature(SECRET, &signed).unwrap())
    }

    fn event(id: &str, event_type: &str, object: serde_json::Value) -> StripeEvent {
        StripeEvent {
            id: id.to_string(),
            event_type: event_type.to_string(),
            data: StripeEventData { object },
        }
    }

    fn subscription_object(status: &str) -> serde_json::Value {
        json!({
            "id": "sub_123",
            "customer": "cus_123",
            "status": status,
            "current_period_end": 1_702_592_000i64,
            "cancel_at_period_end": false,
            "items": {"data": [{"id": "si_1", "price": {"id": "price_pro"}}]},
            "metadata": {"tenant_id": "tenant_1"}
        })
    }

    #[test]
    fn test_verify_event_valid() {
        let (_, handler) = handler();
        let payload = br#"{"id":"evt_1","type":"test","data":{"object":{}}}"#;
        let now = Utc::now();

        let event = handler
            .verify_event(payload, &sign(payload, now.timestamp()), now)
            .unwrap();
        assert_eq!(event.id, "evt_1");
    }

    #[test]
    fn test_verify_event_rejects_bad_signature() {
        let (_, handler) = handler();
        let payload = br#"{"id":"evt_1","type":"test","data":{"object":{}}}"#;
        let now = Utc::now();

        let header = format!("t={},v1=deadbeef", now.timestamp());
        assert_eq!(
            handler.verify_event(payload, &header, now).unwrap_err(),
            BillingError::InvalidWebhookSignature
        );

        let tampered = br#"{"id":"evt_2","type":"test","data":{"object":{}}}"#;
        assert!(
            handler
                .verify_event(tampered, &sign(payload, now.timestamp()), now)
                .is_err()
        );
    }

    #[test]
    fn test_verify_event_rejects_old_timestamp() {
        let (_, handler) = handler();
        let payload = br#"{"id":"evt_1","type":"test","data":{"object":{}}}"#;
        let now = Utc::now();

        let err = handler
            .verify_event(payload, &sign(payload, now.timestamp() - 301), now)
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookTimestampExpired { .. }));
    }

    #[tokio::test]
    async fn test_checkout_completed_links_subscription() {
        let (store, handler) = handler();
        let now = Utc::now();

        let outcome = handler
            .handle_event(
                event(
                    "evt_cs",
                    "checkout.session.completed",
                    json!({
                        "id": "cs_1",
                        "subscription": "sub_123",
                        "customer": "cus_123",
                        "client_reference_id": "tenant_1",
                        "metadata": {"tenant_id": "tenant_1", "plan": "basic"}
                    }),
                ),
                now,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.plan, PlanId::Basic);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.provider_subscription_id.as_deref(), Some("sub_123"));
        assert_eq!(sub.stripe_customer_id.as_deref(), Some("cus_123"));
    }

    #[tokio::test]
    async fn test_payment_checkout_is_ignored() {
        let (store, handler) = handler();
        let outcome = handler
            .handle_event(
                event("evt_pay", "checkout.session.completed", json!({"id": "cs_2"})),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(store.get_processed_events().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_updated_syncs_plan_from_price() {
        let (store, handler) = handler();

        let outcome = handler
            .handle_event(
                event(
                    "evt_upd",
                    "customer.subscription.updated",
                    subscription_object("active"),
                ),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.plan, PlanId::Professional);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.ends_at, DateTime::from_timestamp(1_702_592_000, 0));
    }

    #[tokio::test]
    async fn test_subscription_event_resolves_tenant_by_customer() {
        let (store, handler) = handler();
        let now = Utc::now();
        let mut existing = crate::billing::storage::StoredSubscription::signup("tenant_9", now);
        existing.stripe_customer_id = Some("cus_123".to_string());
        store.save_subscription(&existing).await.unwrap();

        let mut object = subscription_object("trialing");
        object["metadata"] = json!({});

        let outcome = handler
            .handle_event(event("evt_c", "customer.subscription.created", object), now)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(
            store.get_all_subscriptions()["tenant_9"].plan,
            PlanId::Professional
        );
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_ignored() {
        let (_, handler) = handler();
        let mut object = subscription_object("active");
        object["metadata"] = json!({});
        object["customer"] = json!("cus_unknown");

        let outcome = handler
            .handle_event(event("evt_u", "customer.subscription.updated", object), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_invoice_events_toggle_past_due() {
        let (store, handler) = handler();
        let now = Utc::now();
        handler
            .handle_event(
                event("evt_1", "customer.subscription.created", subscription_object("active")),
                now,
            )
            .await
            .unwrap();

        let failed = handler
            .handle_event(
                event("evt_2", "invoice.payment_failed", json!({"subscription": "sub_123"})),
                now,
            )
            .await
            .unwrap();
        assert_eq!(failed, WebhookOutcome::Processed);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"].status,
            SubscriptionStatus::PastDue
        );

        let paid = handler
            .handle_event(
                event("evt_3", "invoice.paid", json!({"subscription": "sub_123"})),
                now,
            )
            .await
            .unwrap();
        assert_eq!(paid, WebhookOutcome::Processed);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"].status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_invoice_for_unknown_subscription_is_ignored() {
        let (_, handler) = handler();
        let outcome = handler
            .handle_event(
                event("evt_i", "invoice.paid", json!({"subscription": "sub_missing"})),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_deleted_cancels_and_redelivery_is_noop() {
        let (store, handler) = handler();
        let now = Utc::now();
        handler
            .handle_event(
                event("evt_1", "customer.subscription.created", subscription_object("active")),
                now,
            )
            .await
            .unwrap();

        let deleted = event(
            "evt_del",
            "customer.subscription.deleted",
            subscription_object("canceled"),
        );
        assert_eq!(
            handler.handle_event(deleted.clone(), now).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(
            handler.handle_event(deleted, now).await.unwrap(),
            WebhookOutcome::AlreadyProcessed
        );

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_ignored() {
        let (store, handler) = handler();
        let now = Utc::now();
        handler
            .handle_event(
                event("evt_1", "customer.subscription.created", subscription_object("active")),
                now,
            )
            .await
            .unwrap();
        handler
            .handle_event(
                event("evt_2", "customer.subscription.deleted", subscription_object("canceled")),
                now,
            )
            .await
            .unwrap();

        // Same object cannot come back from canceled.
        let outcome = handler
            .handle_event(
                event("evt_3", "customer.subscription.updated", subscription_object("active")),
                now,
            )
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"].status,
            SubscriptionStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let (_, handler) = handler();
        let outcome = handler
            .handle_event(event("evt_x", "charge.refunded", json!({})), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }
}
