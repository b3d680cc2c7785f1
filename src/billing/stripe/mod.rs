//! Stripe billing adapter.
//!
//! Wraps a [`StripeApi`] behind the [`BillingProvider`] trait. Checkout
//! sessions and subscriptions carry `tenant_id` and `plan` metadata so that
//! webhook events can be routed back to the tenant.

mod client;
mod live_client;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

pub use client::{
    CreateCheckoutSessionRequest, CreateCustomerRequest, StripeApi, StripeSubscriptionData,
};
pub use live_client::{LiveStripeApi, LiveStripeApiConfig};
pub use webhook::{StripeWebhookHandler, verify_stripe_signature};

#[cfg(any(test, feature = "test-billing"))]
pub use client::test::MockStripeApi;

use super::error::{BillingError, BillingResult};
use super::plans::PlanId;
use super::provider::{BillingProvider, CheckoutHandle, CheckoutUrls};
use super::storage::{Billable, ProviderKind, StoredSubscription, SubscriptionStatus};
use super::subscription::SubscriptionManager;

/// Metadata key for the tenant id.
pub(crate) const META_TENANT_ID: &str = "tenant_id";
/// Metadata key for the plan id.
pub(crate) const META_PLAN: &str = "plan";

/// Translate a Stripe subscription status.
#[must_use]
pub fn map_status(provider_status: &str) -> SubscriptionStatus {
    match provider_status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trialing,
        "past_due" | "unpaid" => SubscriptionStatus::PastDue,
        "canceled" | "incomplete_expired" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::Incomplete,
    }
}

/// Stripe price ids per paid plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StripePrices {
    prices: HashMap<PlanId, String>,
}

impl StripePrices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the price for a plan. The free plan is never priced.
    #[must_use]
    pub fn with_price(mut self, plan: PlanId, price_id: impl Into<String>) -> Self {
        if plan.is_paid() {
            self.prices.insert(plan, price_id.into());
        }
        self
    }

    #[must_use]
    pub fn price_for(&self, plan: PlanId) -> Option<&str> {
        self.prices.get(&plan).map(String::as_str)
    }

    /// Reverse lookup of the plan billed by a price.
    #[must_use]
    pub fn plan_for_price(&self, price_id: &str) -> Option<PlanId> {
        self.prices
            .iter()
            .find(|(_, id)| id.as_str() == price_id)
            .map(|(plan, _)| *plan)
    }
}

/// [`BillingProvider`] backed by Stripe.
#[derive(Clone)]
pub struct StripeAdapter {
    api: Arc<dyn StripeApi>,
    subscriptions: SubscriptionManager,
    prices: StripePrices,
}

impl StripeAdapter {
    #[must_use]
    pub fn new(
        api: Arc<dyn StripeApi>,
        subscriptions: SubscriptionManager,
        prices: StripePrices,
    ) -> Self {
        Self {
            api,
            subscriptions,
            prices,
        }
    }

    #[must_use]
    pub fn prices(&self) -> &StripePrices {
        &self.prices
    }
}

#[async_trait]
impl BillingProvider for StripeAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn ensure_customer(&self, tenant: &dyn Billable) -> BillingResult<String> {
        let now = Utc::now();
        let sub = self
            .subscriptions
            .get_or_create(tenant.tenant_id(), now)
            .await?;

        if let Some(id) = sub.stripe_customer_id {
            return Ok(id);
        }

        let customer_id = self
            .api
            .create_customer(CreateCustomerRequest {
                email: tenant.email().to_string(),
                name: tenant.name().map(str::to_string),
                tenant_id: tenant.tenant_id().to_string(),
            })
            .await?;

        self.subscriptions
            .link_customer(tenant.tenant_id(), ProviderKind::Stripe, &customer_id, now)
            .await?;

        tracing::info!(
            target: "clinify::billing::stripe",
            tenant_id = %tenant.tenant_id(),
            customer_id = %customer_id,
            "Created Stripe customer"
        );

        Ok(customer_id)
    }

    async fn start_checkout(
        &self,
        tenant: &dyn Billable,
        plan: PlanId,
        urls: &CheckoutUrls,
    ) -> BillingResult<CheckoutHandle> {
        let price_id = self
            .prices
            .price_for(plan)
            .ok_or_else(|| BillingError::PlanNotAvailable {
                plan: plan.to_string(),
                provider: ProviderKind::Stripe.to_string(),
            })?
            .to_string();

        let customer_id = self.ensure_customer(tenant).await?;

        let handle = self
            .api
            .create_checkout_session(CreateCheckoutSessionRequest {
                customer_id,
                price_id,
                tenant_id: tenant.tenant_id().to_string(),
                plan,
                success_url: urls.success_url.clone(),
                cancel_url: urls.cancel_url.clone(),
            })
            .await?;

        tracing::info!(
            target: "clinify::billing::stripe",
            tenant_id = %tenant.tenant_id(),
            plan = %plan,
            session_id = %handle.session_id,
            "Created checkout session"
        );

        Ok(handle)
    }

    async fn cancel(
        &self,
        tenant: &dyn Billable,
        at_period_end: bool,
    ) -> BillingResult<StoredSubscription> {
        let no_subscription = || BillingError::NoActiveSubscription {
            tenant_id: tenant.tenant_id().to_string(),
        };

        let customer_id = self
            .subscriptions
            .get(tenant.tenant_id())
            .await?
            .and_then(|sub| sub.stripe_customer_id)
            .ok_or_else(no_subscription)?;

        let active = self
            .api
            .list_active_subscriptions(&customer_id)
            .await?
            .into_iter()
            .find(|s| {
                matches!(
                    map_status(&s.status),
                    SubscriptionStatus::Active
                        | SubscriptionStatus::Trialing
                        | SubscriptionStatus::PastDue
                )
            })
            .ok_or_else(no_subscription)?;

        if at_period_end {
            self.api.cancel_subscription_at_period_end(&active.id).await?;
        } else {
            self.api.cancel_subscription(&active.id).await?;
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

    struct Tenant;

    impl Billable for Tenant {
        fn tenant_id(&self) -> &str {
            "tenant_1"
        }

        fn email(&self) -> &str {
            "owner@clinic.example"
        }

        fn name(&self) -> Option<&str> {
            Some("Clinic One")
        }
    }

    fn urls() -> CheckoutUrls {
        CheckoutUrls {
            success_url: "https://app.example/ok".to_string(),
            cancel_url: "https://app.example/cancel".to_string(),
        }
    }

    fn setup() -> (InMemoryBillingStore, Arc<MockStripeApi>, StripeAdapter) {
        let store = InMemoryBillingStore::new();
        let api = Arc::new(MockStripeApi::new());
        let adapter = StripeAdapter::new(
            api.clone(),
            SubscriptionManager::new(Arc::new(store.clone())),
            StripePrices::new()
                .with_price(PlanId::Basic, "price_basic")
                .with_price(PlanId::Professional, "price_pro"),
        );
        (store, api, adapter)
    }

    fn active_sub(id: &str, customer_id: &str, status: &str) -> StripeSubscriptionData {
        StripeSubscriptionData {
            id: id.to_string(),
            customer_id: customer_id.to_string(),
            status: status.to_string(),
            current_period_end: Utc::now().timestamp() + 86_400,
            cancel_at_period_end: false,
            metadata: HashMap::new(),
            price_id: Some("price_basic".to_string()),
        }
    }

    #[test]
    fn test_map_status() {
        assert_eq!(map_status("active"), SubscriptionStatus::Active);
        assert_eq!(map_status("trialing"), SubscriptionStatus::Trialing);
        assert_eq!(map_status("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(map_status("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(map_status("canceled"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("incomplete_expired"), SubscriptionStatus::Canceled);
        assert_eq!(map_status("incomplete"), SubscriptionStatus::Incomplete);
        assert_eq!(map_status("paused"), SubscriptionStatus::Incomplete);
        assert_eq!(map_status("something_new"), SubscriptionStatus::Incomplete);
        assert_eq!(map_status(""), SubscriptionStatus::Incomplete);
    }

    #[test]
    fn test_free_plan_is_never_priced() {
        let prices = StripePrices::new().with_price(PlanId::Free, "price_free");
        assert_eq!(prices.price_for(PlanId::Free), None);
    }

    #[test]
    fn test_plan_for_price() {
        let (_, _, adapter) = setup();
        assert_eq!(
            adapter.prices().plan_for_price("price_pro"),
            Some(PlanId::Professional)
        );
        assert_eq!(adapter.prices().plan_for_price("price_other"), None);
    }

    #[tokio::test]
    async fn test_ensure_customer_is_idempotent() {
        let (store, api, adapter) = setup();

        let first = adapter.ensure_customer(&Tenant).await.unwrap();
        let second = adapter.ensure_customer(&Tenant).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(api.customer_count(), 1);

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.stripe_customer_id.as_deref(), Some(first.as_str()));
        assert_eq!(sub.plan, PlanId::Free);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn test_checkout_for_free_plan_fails() {
        let (_, api, adapter) = setup();
        let err = adapter
            .start_checkout(&Tenant, PlanId::Free, &urls())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PlanNotAvailable { .. }));
        assert_eq!(api.customer_count(), 0);
    }

    #[tokio::test]
    async fn test_checkout_for_unpriced_plan_fails() {
        let (_, _, adapter) = setup();
        let err = adapter
            .start_checkout(&Tenant, PlanId::Enterprise, &urls())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BillingError::PlanNotAvailable {
                plan: "enterprise".to_string(),
                provider: "stripe".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_checkout_does_not_change_status() {
        let (store, api, adapter) = setup();

        let handle = adapter
            .start_checkout(&Tenant, PlanId::Basic, &urls())
            .await
            .unwrap();
        assert!(handle.session_url.contains(&handle.session_id));

        let sessions = api.sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].price_id, "price_basic");
        assert_eq!(sessions[0].tenant_id, "tenant_1");
        assert_eq!(sessions[0].plan, PlanId::Basic);

        let sub = store.get_all_subscriptions().remove("tenant_1").unwrap();
        assert_eq!(sub.plan, PlanId::Free);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
    }

    #[tokio::test]
    async fn test_cancel_without_customer() {
        let (_, _, adapter) = setup();
        let err = adapter.cancel(&Tenant, false).await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription { .. }));
    }

    #[tokio::test]
    async fn test_cancel_without_active_subscription() {
        let (_, api, adapter) = setup();
        let customer_id = adapter.ensure_customer(&Tenant).await.unwrap();
        api.add_subscription(active_sub("sub_old", &customer_id, "incomplete_expired"));

        let err = adapter.cancel(&Tenant, true).await.unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription { .. }));
        assert!(api.cancellations().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_immediately() {
        let (store, api, adapter) = setup();
        let customer_id = adapter.ensure_customer(&Tenant).await.unwrap();
        api.add_subscription(active_sub("sub_1", &customer_id, "active"));

        let sub = adapter.cancel(&Tenant, false).await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Canceled);
        assert!(sub.canceled_at.is_some());
        assert_eq!(api.cancellations(), vec![("sub_1".to_string(), false)]);
        assert_eq!(
            store.get_all_subscriptions()["tenant_1"].status,
            SubscriptionStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_keeps_status() {
        let (_, api, adapter) = setup();
        let customer_id = adapter.ensure_customer(&Tenant).await.unwrap();
        api.add_subscription(active_sub("sub_1", &customer_id, "active"));

        let sub = adapter.cancel(&Tenant, true).await.unwrap();

        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert!(sub.cancel_at_period_end);
        assert!(sub.canceled_at.is_none());
        assert_eq!(api.cancellations(), vec![("sub_1".to_string(), true)]);
    }

    #[tokio::test]
    async fn test_upstream_failure_propagates() {
        let (_, api, adapter) = setup();
        api.fail_requests(true);
        let err = adapter.ensure_customer(&Tenant).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::UpstreamProviderError {
                http_status: Some(500),
                ..
            }
        ));
    }
}
