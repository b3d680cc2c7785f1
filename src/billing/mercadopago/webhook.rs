//! MercadoPago webhook handling.
//!
//! Notifications only carry the preapproval id, so the handler re-fetches the
//! preapproval and applies its current state to the tenant named by
//! `external_reference`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::client::MercadoPagoApi;
use super::{MercadoPagoPrices, map_status};
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::storage::{BillingStore, ProviderKind};
use crate::billing::subscription::{
    ProviderSubscriptionUpdate, SubscriptionManager, TransitionOutcome,
};
use crate::billing::webhook::{WebhookOutcome, parse_payload, parse_signature_header, verify_signature};

/// Verify an `x-signature` header (`ts=...,v1=...`).
///
/// The signed manifest is `id:{data.id};request-id:{x-request-id};ts:{ts};`.
pub fn verify_mercadopago_signature(
    secret: &str,
    data_id: &str,
    request_id: &str,
    header: &str,
) -> BillingResult<()> {
    let (ts, signature) = parse_signature_header(header, "ts")?;
    let manifest = format!("id:{};request-id:{};ts:{};", data_id, request_id, ts);
    verify_signature(secret, manifest.as_bytes(), &signature)
}

/// MercadoPago notification body.
#[derive(Debug, Clone, Deserialize)]
pub struct MercadoPagoNotification {
    /// Notification id; numeric in practice.
    pub id: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub notification_type: Option<String>,
    pub action: Option<String>,
    pub data: NotificationData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationData {
    pub id: serde_json::Value,
}

fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl MercadoPagoNotification {
    /// The id of the object the notification is about.
    pub fn data_id(&self) -> BillingResult<String> {
        value_to_string(&self.data.id).ok_or_else(|| BillingError::InvalidWebhookPayload {
            message: "missing data.id".to_string(),
        })
    }
}

/// Webhook handler for MercadoPago notifications.
pub struct MercadoPagoWebhookHandler {
    api: Arc<dyn MercadoPagoApi>,
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionManager,
    webhook_secret: SecretString,
    prices: MercadoPagoPrices,
}

impl MercadoPagoWebhookHandler {
    #[must_use]
    pub fn new(
        api: Arc<dyn MercadoPagoApi>,
        store: Arc<dyn BillingStore>,
        webhook_secret: SecretString,
        prices: MercadoPagoPrices,
    ) -> Self {
        Self {
            api,
            subscriptions: SubscriptionManager::new(store.clone()),
            store,
            webhook_secret,
            prices,
        }
    }

    /// Parse the body and verify its signature.
    pub fn verify_notification(
        &self,
        payload: &[u8],
        signature: &str,
        request_id: &str,
    ) -> BillingResult<MercadoPagoNotification> {
        let notification: MercadoPagoNotification = parse_payload(payload)?;
        let data_id = notification.data_id()?;
        verify_mercadopago_signature(
            self.webhook_secret.expose_secret(),
            &data_id,
            request_id,
            signature,
        )?;
        Ok(notification)
    }

    /// Verify and process a raw webhook delivery.
    pub async fn process(
        &self,
        payload: &[u8],
        signature: &str,
        request_id: &str,
    ) -> BillingResult<WebhookOutcome> {
        let notification = self.verify_notification(payload, signature, request_id)?;
        self.handle_notification(notification, request_id, Utc::now())
            .await
    }

    /// Process a verified notification.
    pub async fn handle_notification(
        &self,
        notification: MercadoPagoNotification,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<WebhookOutcome> {
        let notification_type = notification.notification_type.as_deref().unwrap_or_default();
        if !matches!(notification_type, "subscription_preapproval" | "preapproval") {
            return Ok(WebhookOutcome::Ignored);
        }

        let data_id = notification.data_id()?;
        let event_id = notification
            .id
            .as_ref()
            .and_then(value_to_string)
            .unwrap_or_else(|| format!("{}:{}", data_id, request_id));

        if self
            .store
            .is_event_processed(ProviderKind::MercadoPago, &event_id)
            .await?
        {
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        let preapproval = self.api.get_preapproval(&data_id).await?;
        let Some(tenant_id) = preapproval.external_reference.clone() else {
            tracing::warn!(
                target: "clinify::billing::mercadopago",
                preapproval_id = %preapproval.id,
                "Preapproval has no external reference"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let mut update = ProviderSubscriptionUpdate::new(
            tenant_id,
            ProviderKind::MercadoPago,
            preapproval.id.clone(),
            map_status(&preapproval.status),
        );
        if let Some(plan) = preapproval
            .amount()
            .and_then(|amount| self.prices.plan_for_amount(amount))
        {
            update = update.plan(plan);
        }
        if let Some(next_payment) = preapproval.next_payment_date {
            update = update.period_end(next_payment);
        }
        if let Some(end_date) = preapproval.auto_recurring.as_ref().and_then(|r| r.end_date) {
            update = update.period_end(end_date).cancel_at_period_end(true);
        }

        let outcome = match self.subscriptions.apply_provider_update(update, now).await? {
            TransitionOutcome::Applied(_) => WebhookOutcome::Processed,
            TransitionOutcome::Rejected { .. } => WebhookOutcome::Ignored,
        };

        if outcome == WebhookOutcome::Processed {
            self.store
                .mark_event_processed(ProviderKind::MercadoPago, &event_id)
                .await?;
        }

        tracing::info!(
            target: "clinify::billing::mercadopago",
            event_id = %event_id,
            preapproval_id = %preapproval.id,
            status = %preapproval.status,
            outcome = ?outcome,
            "Handled MercadoPago webhook"
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::mercadopago::MockMercadoPagoApi;
    use crate::billing::mercadopago::client::{AutoRecurring, Preapproval};
    use crate::billing::plans::PlanId;
    use crate::billing::storage::SubscriptionStatus;
    use crate::billing::storage::test::InMemoryBillingStore;
    use crate::billing::webhook::compute_signature;
    use serde_json::json;

    const SECRET: &str = "mp_webhook_secret";

    fn setup() -> (InMemoryBillingStore, Arc<MockMercadoPagoApi>, MercadoPagoWebhookHandler) {
        let store = InMemoryBillingStore::new();
        let api = Arc::new(MockMercadoPagoApi::new());
        let handler = MercadoPagoWebhookHandler::new(
            api.clone(),
            Arc::new(store.clone()),
            SecretString::from(SECRET.to_string()),
            MercadoPagoPrices::new().with_price(PlanId::Basic, 99.9),
        );
        (store, api, handler)
    }

    fn preapproval(status: &str) -> Preapproval {
        Preapproval {
            id: "pre_1".to_string(),
            status: status.to_string(),
            external_reference: Some("tenant_1".to_string()),
            payer_id: None,
            init_point: None,
            next_payment_date: DateTime::from_timestamp(1_900_000_000, 0),
            auto_recurring: Some(AutoRecurring {
                frequency: 1,
                frequency_type: "months".to_string(),
                transaction_amount: 99.9,
                currency_id: "BRL".to_string(),
                end_date: None,
            }),
        }
    }

    fn notification(id: u64) -> MercadoPagoNotification {
        serde_json::from_value(json!({
            "id": id,
            "type": "subscription_preapproval",
            "action": "updated",
            "data": {"id": "pre_1"}
        }))
        .unwrap()
    }

    fn sign(data_id: &str, request_id: &str, ts: i64) -> String {
        let manifest = format!("id:{};request-id:{};ts:{};", data_id, request_id, ts);
        format!(
            "ts={},v1={}",
            ts,
            compute_signature(SECRET, manifest.as_bytes()).unwrap()
        )
    }

    #[test]
    fn test_verify_signature() {
        let (_, _, handler) = setup();
        let body = br#"{"id":1,"type":"subscription_preapproval","data":{"id":"pre_1"}}"#;

        assert!(
            handler
                .verify_notification(body, &sign("pre_1", "req-1", 1_700_000_000), "req-1")
                .is_ok()
        );
        assert_eq!(
            handler
                .verify_notification(body, &sign("pre_1", "req-1", 1_700_000_000), "req-2")
                .unwrap_err(),
            BillingError::InvalidWebhookSignature
        );
        assert_eq!(
            handler
                .verify_notification(body, &sign("pre_2", "req-1", 1_700_000_000), "req-1")
                .unwrap_err(),
            BillingError::InvalidWebhookSignature
        );
    }

    #[test]
    fn test_numeric_data_id() {
        let n: MercadoPagoNotification =
            serde_json::from_value(json!({"type": "payment", "data": {"id": 42}})).unwrap();
        assert_eq!(n.data_id().unwrap(), "42");
    }

    #[tokio::test]
    async fn test_authorized_preapproval_activates_plan() {
        let (store, api, handler) = setup();
        api.put_preapproval(preapproval("authorized"));

        let outcome = handler
            .handle_notification(notification(1), "req-1", Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.plan, PlanId::Basic);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.provider, Some(ProviderKind::MercadoPago));
        assert_eq!(sub.ends_at, DateTime::from_timestamp(1_900_000_000, 0));
    }

    #[tokio::test]
    async fn test_redelivery_is_noop() {
        let (_, api, handler) = setup();
        api.put_preapproval(preapproval("authorized"));
        let now = Utc::now();

        handler
            .handle_notification(notification(7), "req-1", now)
            .await
            .unwrap();
        let again = handler
            .handle_notification(notification(7), "req-1", now)
            .await
            .unwrap();
        assert_eq!(again, WebhookOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_cancelled_then_paused_is_ignored() {
        let (store, api, handler) = setup();
        let now = Utc::now();
        api.put_preapproval(preapproval("authorized"));
        handler
            .handle_notification(notification(1), "r", now)
            .await
            .unwrap();
        api.set_status("pre_1", "cancelled");
        handler
            .handle_notification(notification(2), "r", now)
            .await
            .unwrap();
        api.set_status("pre_1", "paused");

        let outcome = handler
            .handle_notification(notification(3), "r", now)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"].status,
            SubscriptionStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_other_notification_types_are_ignored() {
        let (_, _, handler) = setup();
        let n: MercadoPagoNotification =
            serde_json::from_value(json!({"id": 1, "type": "payment", "data": {"id": "123"}}))
                .unwrap();
        assert_eq!(
            handler.handle_notification(n, "r", Utc::now()).await.unwrap(),
            WebhookOutcome::Ignored
        );
    }
}
