//! MercadoPago billing adapter.
//!
//! A Clinify subscription maps to a MercadoPago preapproval whose
//! `external_reference` is the tenant id. The payer authorizes it at the
//! preapproval's `init_point`; status changes arrive by webhook.

mod client;
mod live_client;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

pub use client::{
    AutoRecurring, CURRENCY_ID, CreatePreapprovalRequest, MercadoPagoApi, Preapproval,
};
pub use live_client::{LiveMercadoPagoApi, LiveMercadoPagoApiConfig};
pub use webhook::{MercadoPagoWebhookHandler, verify_mercadopago_signature};

#[cfg(any(test, feature = "test-billing"))]
pub use client::test::MockMercadoPagoApi;

use super::error::{BillingError, BillingResult};
use super::plans::PlanId;
use super::provider::{BillingProvider, CheckoutHandle, CheckoutUrls};
use super::storage::{Billable, ProviderKind, StoredSubscription, SubscriptionStatus};
use super::subscription::SubscriptionManager;

/// Translate a MercadoPago preapproval status.
#[must_use]
pub fn map_status(provider_status: &str) -> SubscriptionStatus {
    match provider_status {
        "authorized" => SubscriptionStatus::Active,
        "pending" => SubscriptionStatus::Incomplete,
        "paused" => SubscriptionStatus::PastDue,
        "cancelled" | "canceled" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Incomplete,
    }
}

/// Monthly BRL amounts per paid plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MercadoPagoPrices {
    prices: HashMap<PlanId, f64>,
}

impl MercadoPagoPrices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the amount for a plan. The free plan and non-positive amounts are ignored.
    #[must_use]
    pub fn with_price(mut self, plan: PlanId, amount: f64) -> Self {
        if plan.is_paid() && amount > 0.0 {
            self.prices.insert(plan, amount);
        }
        self
    }

    #[must_use]
    pub fn price_for(&self, plan: PlanId) -> Option<f64> {
        self.prices.get(&plan).copied()
    }

    /// Reverse lookup of the plan billed at `amount`.
    #[must_use]
    pub fn plan_for_amount(&self, amount: f64) -> Option<PlanId> {
        self.prices
            .iter()
            .find(|(_, price)| (**price - amount).abs() < 0.005)
            .map(|(plan, _)| *plan)
    }
}

/// [`BillingProvider`] backed by MercadoPago preapprovals.
#[derive(Clone)]
pub struct MercadoPagoAdapter {
    api: Arc<dyn MercadoPagoApi>,
    subscriptions: SubscriptionManager,
    prices: MercadoPagoPrices,
}

impl MercadoPagoAdapter {
    #[must_use]
    pub fn new(
        api: Arc<dyn MercadoPagoApi>,
        subscriptions: SubscriptionManager,
        prices: MercadoPagoPrices,
    ) -> Self {
        Self {
            api,
            subscriptions,
            prices,
        }
    }
}

#[async_trait]
impl BillingProvider for MercadoPagoAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::MercadoPago
    }

    async fn ensure_customer(&self, tenant: &dyn Billable) -> BillingResult<String> {
        let now = Utc::now();
        let sub = self
            .subscriptions
            .get_or_create(tenant.tenant_id(), now)
            .await?;

        if let Some(id) = sub.mercadopago_customer_id {
            return Ok(id);
        }

        // MercadoPago rejects a second customer with the same email.
        let customer_id = match self.api.search_customer_by_email(tenant.email()).await? {
            Some(id) => id,
            None => {
                self.api
                    .create_customer(tenant.email(), tenant.name())
                    .await?
            }
        };

        self.subscriptions
            .link_customer(
                tenant.tenant_id(),
                ProviderKind::MercadoPago,
                &customer_id,
                now,
            )
            .await?;

        tracing::info!(
            target: "clinify::billing::mercadopago",
            tenant_id = %tenant.tenant_id(),
            customer_id = %customer_id,
            "Linked MercadoPago customer"
        );

        Ok(customer_id)
    }

    async fn start_checkout(
        &self,
        tenant: &dyn Billable,
        plan: PlanId,
        urls: &CheckoutUrls,
    ) -> BillingResult<CheckoutHandle> {
        let amount = self
            .prices
            .price_for(plan)
            .ok_or_else(|| BillingError::PlanNotAvailable {
                plan: plan.to_string(),
                provider: ProviderKind::MercadoPago.to_string(),
            })?;

        self.ensure_customer(tenant).await?;

        let preapproval = self
            .api
            .create_preapproval(CreatePreapprovalRequest {
                reason: format!("Clinify {}", plan.as_str()),
                external_reference: tenant.tenant_id().to_string(),
                payer_email: tenant.email().to_string(),
                back_url: urls.success_url.clone(),
                transaction_amount: amount,
            })
            .await?;

        let session_url = preapproval
            .init_point
            .ok_or_else(|| BillingError::internal("Preapproval init_point missing"))?;

        tracing::info!(
            target: "clinify::billing::mercadopago",
            tenant_id = %tenant.tenant_id(),
            plan = %plan,
            preapproval_id = %preapproval.id,
            "Created preapproval checkout"
        );

        Ok(CheckoutHandle {
            session_id: preapproval.id,
            session_url,
        })
    }

    async fn cancel(
        &self,
        tenant: &dyn Billable,
        at_period_end: bool,
    ) -> BillingResult<StoredSubscription> {
        let no_subscription = || BillingError::NoActiveSubscription {
            tenant_id: tenant.tenant_id().to_string(),
        };

        let record = self
            .subscriptions
            .get(tenant.tenant_id())
            .await?
            .ok_or_else(no_subscription)?;

        let active = self
            .api
            .search_preapprovals(tenant.tenant_id())
            .await?
            .into_iter()
            .find(|p| {
                matches!(
                    map_status(&p.status),
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue
                )
            })
            .ok_or_else(no_subscription)?;

        if at_period_end {
            let now = Utc::now();
            let end_date = active
                .next_payment_date
                .or(record.ends_at)
                .filter(|end| *end > now)
                .unwrap_or(now);
            self.api.end_preapproval_at(&active.id, end_date).await?;
        } else {
            self.api.cancel_preapproval(&active.id).await?;
        }

        self.subscriptions
            .record_cancellation(tenant.tenant_id(), at_period_end, Utc::now())
            .await
    }

    fn map_status(&self, provider_status: &str) -> SubscriptionStatus {
        map_status(provider_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::storage::test::InMemoryBillingStore;
    use chrono::Duration;

    struct Tenant;

    impl Billable for Tenant {
        fn tenant_id(&self) -> &str {
            "tenant_1"
        }

        fn email(&self) -> &str {
            "owner@clinic.example"
        }

        fn name(&self) -> Option<&str> {
            None
        }
    }

    fn urls() -> CheckoutUrls {
        CheckoutUrls {
            success_url: "https://app.example/ok".to_string(),
            cancel_url: "https://app.example/cancel".to_string(),
        }
    }

    fn setup() -> (InMemoryBillingStore, Arc<MockMercadoPagoApi>, MercadoPagoAdapter) {
        let store = InMemoryBillingStore::new();
        let api = Arc::new(MockMercadoPagoApi::new());
        let adapter = MercadoPagoAdapter::new(
            api.clone(),
            SubscriptionManager::new(Arc::new(store.clone())),
            MercadoPagoPrices::new()
                .with_price(PlanId::Basic, 99.9)
                .with_price(PlanId::Professional, 199.9),
        );
        (store, api, adapter)
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("authorized"), SubscriptionStatus::Active);
        assert_eq!(map_status("pending"), SubscriptionStatus::Incomplete);
        assert_eq!(map_status("paused"), SubscriptionStatus::PastDue);
        assert_eq!(map_status("cancelled"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("canceled"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("finished"), SubscriptionStatus::Incomplete);
        assert_eq!(map_status(""), SubscriptionStatus::Incomplete);
    }

    #[test]
    fn test_prices() {
        let prices = MercadoPagoPrices::new()
            .with_price(PlanId::Free, 10.0)
            .with_price(PlanId::Basic, 0.0)
            .with_price(PlanId::Professional, 199.9);
        assert_eq!(prices.price_for(PlanId::Free), None);
        assert_eq!(prices.price_for(PlanId::Basic), None);
        assert_eq!(prices.plan_for_amount(199.9), Some(PlanId::Professional));
        assert_eq!(prices.plan_for_amount(42.0), None);
    }

    #[tokio::test]
    async fn test_ensure_customer_reuses_existing_by_email() {
        let (store, api, adapter) = setup();
        api.add_customer("owner@clinic.example", "mp_existing");

        let id = adapter.ensure_customer(&Tenant).await.unwrap();
        assert_eq!(id, "mp_existing");
        assert_eq!(api.customer_count(), 1);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"]
                .mercadopago_customer_id
                .as_deref(),
            Some("mp_existing")
        );

        assert_eq!(adapter.ensure_customer(&Tenant).await.unwrap(), "mp_existing");
    }

    #[tokio::test]
    async fn test_checkout_creates_pending_preapproval() {
        let (store, api, adapter) = setup();

        let handle = adapter
            .start_checkout(&Tenant, PlanId::Professional, &urls())
            .await
            .unwrap();

        let preapproval = api.preapproval(&handle.session_id).unwrap();
        assert_eq!(preapproval.status, "pending");
        assert_eq!(preapproval.external_reference.as_deref(), Some("tenant_1"));
        assert_eq!(preapproval.amount(), Some(199.9));
        assert!(handle.session_url.contains(&handle.session_id));

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.plan, PlanId::Free);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn test_checkout_without_price_fails() {
        let (_, _, adapter) = setup();
        for plan in [PlanId::Free, PlanId::Enterprise] {
            let err = adapter.start_checkout(&Tenant, plan, &urls()).await.unwrap_err();
            assert!(matches!(err, BillingError::PlanNotAvailable { .. }));
        }
    }

    #[tokio::test]
    async fn test_cancel_without_authorized_preapproval() {
        let (_, _, adapter) = setup();
        adapter
            .start_checkout(&Tenant, PlanId::Basic, &urls())
            .await
            .unwrap();

        // Still pending.
        let err = adapter.cancel(&Tenant, false).await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription { .. }));
    }

    #[tokio::test]
    async fn test_cancel_immediately() {
        let (_, api, adapter) = setup();
        let handle = adapter
            .start_checkout(&Tenant, PlanId::Basic, &urls())
            .await
            .unwrap();
        api.set_status(&handle.session_id, "authorized");

        let sub = adapter.cancel(&Tenant, false).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
        assert_eq!(api.preapproval(&handle.session_id).unwrap().status, "cancelled");
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_sets_end_date() {
        let (_, api, adapter) = setup();
        let handle = adapter
            .start_checkout(&Tenant, PlanId::Basic, &urls())
            .await
            .unwrap();
        let next_payment = Utc::now() + Duration::days(20);
        let mut preapproval = api.preapproval(&handle.session_id).unwrap();
        preapproval.status = "authorized".to_string();
        preapproval.next_payment_date = Some(next_payment);
        api.put_preapproval(preapproval);

        let sub = adapter.cancel(&Tenant, true).await.unwrap();
        assert!(sub.cancel_at_period_end);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);

        let preapproval = api.preapproval(&handle.session_id).unwrap();
        assert_eq!(preapproval.status, "authorized");
        assert_eq!(
            preapproval.auto_recurring.and_then(|r| r.end_date),
            Some(next_payment)
        );
    }
}
