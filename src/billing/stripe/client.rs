//! Stripe API client trait.
//!
//! The adapter only talks to Stripe through [`StripeApi`]. The live
//! implementation uses `async-stripe`; the mock records calls for tests.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::billing::error::BillingResult;
use crate::billing::plans::PlanId;
use crate::billing::provider::CheckoutHandle;

/// Request to create a Stripe customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub name: Option<String>,
    pub tenant_id: String,
}

/// Request to create a subscription checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateCheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub tenant_id: String,
    pub plan: PlanId,
    pub success_url: String,
    pub cancel_url: String,
}

/// The fields of a Stripe subscription the adapter needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSubscriptionData {
    pub id: String,
    pub customer_id: String,
    /// Raw Stripe status (`active`, `past_due`, ...).
    pub status: String,
    /// Unix timestamp.
    pub current_period_end: i64,
    pub cancel_at_period_end: bool,
    pub metadata: HashMap<String, String>,
    /// Price of the first subscription item.
    pub price_id: Option<String>,
}

/// Stripe operations used by the billing adapter.
#[async_trait]
pub trait StripeApi: Send + Sync {
    /// Create a customer and return its id.
    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String>;

    /// Create a subscription-mode checkout session.
    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> BillingResult<CheckoutHandle>;

    /// List a customer's subscriptions that have not been canceled.
    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<StripeSubscriptionData>>;

    /// Cancel a subscription immediately.
    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// Cancel a subscription at the end of the current period.
    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> BillingResult<()>;
}

/// Mock Stripe API for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::billing::error::BillingError;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::RwLock;

    /// Mock [`StripeApi`] with in-memory customers and subscriptions.
    #[derive(Default)]
    pub struct MockStripeApi {
        customer_counter: AtomicU64,
        session_counter: AtomicU64,
        customers: RwLock<Vec<CreateCustomerRequest>>,
        sessions: RwLock<Vec<CreateCheckoutSessionRequest>>,
        subscriptions: RwLock<HashMap<String, Vec<StripeSubscriptionData>>>,
        canceled: RwLock<Vec<(String, bool)>>,
        fail_requests: AtomicBool,
    }

    impl MockStripeApi {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a subscription for a customer.
        pub fn add_subscription(&self, subscription: StripeSubscriptionData) {
            self.subscriptions
                .write()
                .unwrap()
                .entry(subscription.customer_id.clone())
                .or_default()
                .push(subscription);
        }

        /// Make every call fail with a Stripe 500.
        pub fn fail_requests(&self, fail: bool) {
            self.fail_requests.store(fail, Ordering::SeqCst);
        }

        /// Number of customers created.
        #[must_use]
        pub fn customer_count(&self) -> usize {
            self.customers.read().unwrap().len()
        }

        /// Checkout sessions created, in order.
        #[must_use]
        pub fn sessions(&self) -> Vec<CreateCheckoutSessionRequest> {
            self.sessions.read().unwrap().clone()
        }

        /// Cancellations as `(subscription_id, at_period_end)`.
        #[must_use]
        pub fn cancellations(&self) -> Vec<(String, bool)> {
            self.canceled.read().unwrap().clone()
        }

        fn check(&self, operation: &str) -> BillingResult<()> {
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(BillingError::upstream(
                    "stripe",
                    operation,
                    "mock failure",
                    Some(500),
                ));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StripeApi for MockStripeApi {
        async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
            self.check("create_customer")?;
            let id = format!(
                "cus_mock_{}",
                self.customer_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.customers.write().unwrap().push(request);
            Ok(id)
        }

        async fn create_checkout_session(
            &self,
            request: CreateCheckoutSessionRequest,
        ) -> BillingResult<CheckoutHandle> {
            self.check("create_checkout_session")?;
            let id = format!(
                "cs_mock_{}",
                self.session_counter.fetch_add(1, Ordering::SeqCst)
            );
            self.sessions.write().unwrap().push(request);
            Ok(CheckoutHandle {
                session_url: format!("https://checkout.stripe.com/c/pay/{}", id),
                session_id: id,
            })
        }

        async fn list_active_subscriptions(
            &self,
            customer_id: &str,
        ) -> BillingResult<Vec<StripeSubscriptionData>> {
            self.check("list_subscriptions")?;
            Ok(self
                .subscriptions
                .read()
                .unwrap()
                .get(customer_id)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|s| s.status != "canceled")
                .collect())
        }

        async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
            self.check("cancel_subscription")?;
            self.canceled
                .write()
                .unwrap()
                .push((subscription_id.to_string(), false));
            for subs in self.subscriptions.write().unwrap().values_mut() {
                for sub in subs.iter_mut().filter(|s| s.id == subscription_id) {
                    sub.status = "canceled".to_string();
                }
            }
            Ok(())
        }

        async fn cancel_subscription_at_period_end(
            &self,
            subscription_id: &str,
        ) -> BillingResult<()> {
            self.check("cancel_subscription_at_period_end")?;
            self.canceled
                .write()
                .unwrap()
                .push((subscription_id.to_string(), true));
            for subs in self.subscriptions.write().unwrap().values_mut() {
                for sub in subs.iter_mut().filter(|s| s.id == subscription_id) {
                    sub.cancel_at_period_end = true;
                }
            }
            Ok(())
        }
    }
}
