//! Storage traits for billing data.
//!
//! Implement these traits to persist subscription state and to answer usage
//! counts. A SeaORM implementation lives in `sea_orm_store` and an in-memory
//! implementation is provided for testing.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::plans::{PlanId, ResourceKind};
use crate::error::Result;

/// Length of the trial granted at signup.
pub const TRIAL_DAYS: i64 = 14;

/// Trait for storing subscription records.
///
/// One record per tenant. Writes are plain upserts; the last writer wins.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Get the subscription for a tenant.
    async fn get_subscription(&self, tenant_id: &str) -> Result<Option<StoredSubscription>>;

    /// Insert or replace the subscription for `subscription.tenant_id`.
    async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()>;

    /// Delete the subscription for a tenant.
    ///
    /// Returns `NotFound` if the tenant has no subscription.
    async fn delete_subscription(&self, tenant_id: &str) -> Result<()>;

    /// Find the subscription driven by a provider subscription object.
    async fn find_by_provider_subscription(
        &self,
        provider: ProviderKind,
        provider_subscription_id: &str,
    ) -> Result<Option<StoredSubscription>>;

    /// Find the subscription linked to a provider customer.
    async fn find_by_customer_id(
        &self,
        provider: ProviderKind,
        customer_id: &str,
    ) -> Result<Option<StoredSubscription>>;

    /// List paid subscriptions that lapsed on or before `cutoff`.
    ///
    /// A subscription has lapsed when its plan is paid, its status is
    /// `canceled` or `past_due`, and `ends_at <= cutoff`.
    async fn list_lapsed(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredSubscription>>;

    // Webhook idempotency

    /// Check if a webhook event has already been processed.
    async fn is_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<bool>;

    /// Mark a webhook event as processed.
    async fn mark_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<()>;
}

/// Live usage counts for quota checks.
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Count a tenant's resources of `kind`.
    ///
    /// With `since`, only resources created (or, for appointments, starting)
    /// at or after that instant are counted.
    async fn count(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        since: Option<DateTime<Utc>>,
    ) -> Result<i64>;
}

/// Tenant removal for the retention sweep.
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Delete a tenant and, by cascade, everything it owns.
    async fn delete_tenant(&self, tenant_id: &str) -> Result<()>;
}

/// A tenant that can be billed.
///
/// Implemented by the authenticated tenant extracted from the request.
pub trait Billable: Send + Sync {
    /// Tenant identifier.
    fn tenant_id(&self) -> &str;

    /// Email used when creating provider customers.
    fn email(&self) -> &str;

    /// Display name for provider customers.
    fn name(&self) -> Option<&str>;
}

/// Billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Stripe,
    #[serde(alias = "mercado_pago")]
    MercadoPago,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stripe => "stripe",
            Self::MercadoPago => "mercadopago",
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stripe" => Ok(Self::Stripe),
            "mercadopago" | "mercado_pago" => Ok(Self::MercadoPago),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant's subscription record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredSubscription {
    pub tenant_id: String,
    pub plan: PlanId,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    /// End of the trial or current paid period.
    pub ends_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub stripe_customer_id: Option<String>,
    pub mercadopago_customer_id: Option<String>,
    /// Provider whose subscription object currently drives this record.
    pub provider: Option<ProviderKind>,
    pub provider_subscription_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoredSubscription {
    /// The record created at signup: free plan, trialing for [`TRIAL_DAYS`].
    #[must_use]
    pub fn signup(tenant_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            plan: PlanId::Free,
            status: SubscriptionStatus::Trialing,
            started_at: now,
            ends_at: Some(now + Duration::days(TRIAL_DAYS)),
            cancel_at_period_end: false,
            canceled_at: None,
            stripe_customer_id: None,
            mercadopago_customer_id: None,
            provider: None,
            provider_subscription_id: None,
            updated_at: now,
        }
    }

    /// Check if the subscription grants its plan (active or trialing).
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_entitled()
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.status == SubscriptionStatus::Canceled
    }

    /// The customer id stored for a provider.
    #[must_use]
    pub fn customer_id(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Stripe => self.stripe_customer_id.as_deref(),
            ProviderKind::MercadoPago => self.mercadopago_customer_id.as_deref(),
        }
    }

    pub fn set_customer_id(&mut self, provider: ProviderKind, customer_id: impl Into<String>) {
        let customer_id = Some(customer_id.into());
        match provider {
            ProviderKind::Stripe => self.stripe_customer_id = customer_id,
            ProviderKind::MercadoPago => self.mercadopago_customer_id = customer_id,
        }
    }

    /// Whether the retention sweep should purge this tenant.
    #[must_use]
    pub fn is_lapsed(&self, cutoff: DateTime<Utc>) -> bool {
        self.plan.is_paid()
            && matches!(
                self.status,
                SubscriptionStatus::Canceled | SubscriptionStatus::PastDue
            )
            && self.ends_at.is_some_and(|end| end <= cutoff)
    }

    /// Remaining trial days, if trialing.
    #[must_use]
    pub fn trial_days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        if self.status != SubscriptionStatus::Trialing {
            return None;
        }
        self.ends_at
            .filter(|end| *end > now)
            .map(|end| (end - now).num_days())
    }
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    PastDue,
    Trialing,
    Incomplete,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::PastDue => "past_due",
            Self::Trialing => "trialing",
            Self::Incomplete => "incomplete",
        }
    }

    /// Parse a stored status. Unknown values read as `Incomplete`.
    #[must_use]
    pub fn parse_lossy(value: &str) -> Self {
        match value {
            "active" => Self::Active,
            "canceled" => Self::Canceled,
            "past_due" => Self::PastDue,
            "trialing" => Self::Trialing,
            _ => Self::Incomplete,
        }
    }

    /// Statuses that grant the subscription's plan.
    #[must_use]
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Whether the lifecycle allows moving from `self` to `next` on the same
    /// provider object.
    ///
    /// Same-status updates are always allowed. `Canceled` is terminal here; a
    /// new provider object restarting a canceled record is handled by
    /// [`SubscriptionStatus::can_restart_as`].
    #[must_use]
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;

        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Incomplete, Trialing | Active | Canceled)
                | (Trialing, Active | PastDue | Canceled)
                | (Active, PastDue | Canceled)
                | (PastDue, Active | Canceled)
        )
    }

    /// Statuses a fresh provider object may start a record in.
    #[must_use]
    pub fn can_restart_as(next: SubscriptionStatus) -> bool {
        matches!(
            next,
            SubscriptionStatus::Incomplete
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::Active
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory billing store for testing.
#[cfg(any(test, feature = "test-billing"))]
pub mod test {
    use super::*;
    use crate::error::ClinifyError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, RwLock};

    /// In-memory implementation of [`BillingStore`], [`UsageStore`] and
    /// [`TenantStore`].
    ///
    /// Wraps data in Arc for cheap cloning.
    #[derive(Default, Clone)]
    pub struct InMemoryBillingStore {
        inner: Arc<InMemoryBillingStoreInner>,
    }

    #[derive(Default)]
    struct InMemoryBillingStoreInner {
        tenants: RwLock<HashSet<String>>,
        subscriptions: RwLock<HashMap<String, StoredSubscription>>,
        processed_events: RwLock<HashSet<(ProviderKind, String)>>,
        usage: RwLock<HashMap<(String, ResourceKind), Vec<DateTime<Utc>>>>,
        fail_reads: AtomicBool,
        fail_counts: AtomicBool,
        fail_deletes: RwLock<HashSet<String>>,
    }

    fn injected(what: &str) -> ClinifyError {
        ClinifyError::internal(format!("injected failure: {}", what))
    }

    impl InMemoryBillingStore {
        /// Create a new in-memory store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a tenant.
        pub fn add_tenant(&self, tenant_id: &str) {
            self.inner
                .tenants
                .write()
                .unwrap()
                .insert(tenant_id.to_string());
        }

        #[must_use]
        pub fn has_tenant(&self, tenant_id: &str) -> bool {
            self.inner.tenants.read().unwrap().contains(tenant_id)
        }

        /// Record `count` resources of `kind` created at `at`.
        pub fn add_usage(&self, tenant_id: &str, kind: ResourceKind, count: usize, at: DateTime<Utc>) {
            self.inner
                .usage
                .write()
                .unwrap()
                .entry((tenant_id.to_string(), kind))
                .or_default()
                .extend(std::iter::repeat_n(at, count));
        }

        /// Make subscription reads fail.
        pub fn fail_reads(&self, fail: bool) {
            self.inner.fail_reads.store(fail, Ordering::SeqCst);
        }

        /// Make usage counts fail.
        pub fn fail_counts(&self, fail: bool) {
            self.inner.fail_counts.store(fail, Ordering::SeqCst);
        }

        /// Make deletes for one tenant fail.
        pub fn fail_deletes_for(&self, tenant_id: &str) {
            self.inner
                .fail_deletes
                .write()
                .unwrap()
                .insert(tenant_id.to_string());
        }

        /// Get all subscriptions (for testing).
        pub fn get_all_subscriptions(&self) -> HashMap<String, StoredSubscription> {
            self.inner.subscriptions.read().unwrap().clone()
        }

        /// Get all processed events (for testing).
        pub fn get_processed_events(&self) -> Vec<(ProviderKind, String)> {
            self.inner
                .processed_events
                .read()
                .unwrap()
                .iter()
                .cloned()
                .collect()
        }

        fn check_delete(&self, tenant_id: &str) -> Result<()> {
            if self.inner.fail_deletes.read().unwrap().contains(tenant_id) {
                return Err(injected("delete"));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl BillingStore for InMemoryBillingStore {
        async fn get_subscription(&self, tenant_id: &str) -> Result<Option<StoredSubscription>> {
            if self.inner.fail_reads.load(Ordering::SeqCst) {
                return Err(injected("read"));
            }
            Ok(self
                .inner
                .subscriptions
                .read()
                .unwrap()
                .get(tenant_id)
                .cloned())
        }

        async fn save_subscription(&self, subscription: &StoredSubscription) -> Result<()> {
            self.add_tenant(&subscription.tenant_id);
            self.inner
                .subscriptions
                .write()
                .unwrap()
                .insert(subscription.tenant_id.clone(), subscription.clone());
            Ok(())
        }

        async fn delete_subscription(&self, tenant_id: &str) -> Result<()> {
            self.check_delete(tenant_id)?;
            match self.inner.subscriptions.write().unwrap().remove(tenant_id) {
                Some(_) => Ok(()),
                None => Err(ClinifyError::not_found(format!(
                    "subscription for tenant {}",
                    tenant_id
                ))),
            }
        }

        async fn find_by_provider_subscription(
            &self,
            provider: ProviderKind,
            provider_subscription_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            Ok(subs
                .values()
                .find(|s| {
                    s.provider == Some(provider)
                        && s.provider_subscription_id.as_deref() == Some(provider_subscription_id)
                })
                .cloned())
        }

        async fn find_by_customer_id(
            &self,
            provider: ProviderKind,
            customer_id: &str,
        ) -> Result<Option<StoredSubscription>> {
            let subs = self.inner.subscriptions.read().unwrap();
            Ok(subs
                .values()
                .find(|s| s.customer_id(provider) == Some(customer_id))
                .cloned())
        }

        async fn list_lapsed(&self, cutoff: DateTime<Utc>) -> Result<Vec<StoredSubscription>> {
            if self.inner.fail_reads.load(Ordering::SeqCst) {
                return Err(injected("read"));
            }
            let subs = self.inner.subscriptions.read().unwrap();
            let mut lapsed: Vec<StoredSubscription> =
                subs.values().filter(|s| s.is_lapsed(cutoff)).cloned().collect();
            lapsed.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
            Ok(lapsed)
        }

        async fn is_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<bool> {
            Ok(self
                .inner
                .processed_events
                .read()
                .unwrap()
                .contains(&(provider, event_id.to_string())))
        }

        async fn mark_event_processed(&self, provider: ProviderKind, event_id: &str) -> Result<()> {
            self.inner
                .processed_events
                .write()
                .unwrap()
                .insert((provider, event_id.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl UsageStore for InMemoryBillingStore {
        async fn count(
            &self,
            tenant_id: &str,
            kind: ResourceKind,
            since: Option<DateTime<Utc>>,
        ) -> Result<i64> {
            if self.inner.fail_counts.load(Ordering::SeqCst) {
                return Err(injected("count"));
            }
            let usage = self.inner.usage.read().unwrap();
            let count = usage
                .get(&(tenant_id.to_string(), kind))
                .map(|records| {
                    records
                        .iter()
                        .filter(|at| since.is_none_or(|since| **at >= since))
                        .count()
                })
                .unwrap_or(0);
            Ok(i64::try_from(count).unwrap_or(i64::MAX))
        }
    }

    #[async_trait]
    impl TenantStore for InMemoryBillingStore {
        async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
            self.check_delete(tenant_id)?;
            if !self.inner.tenants.write().unwrap().remove(tenant_id) {
                return Err(ClinifyError::not_found(format!("tenant {}", tenant_id)));
            }
            self.inner
                .usage
                .write()
                .unwrap()
                .retain(|(owner, _), _| owner != tenant_id);
            self.inner.subscriptions.write().unwrap().remove(tenant_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test::InMemoryBillingStore;
    use super::*;

    fn paid(tenant: &str, status: SubscriptionStatus, ends_at: DateTime<Utc>) -> StoredSubscription {
        StoredSubscription {
            plan: PlanId::Professional,
            status,
            ends_at: Some(ends_at),
            ..StoredSubscription::signup(tenant, ends_at - Duration::days(30))
        }
    }

    #[test]
    fn test_signup_record() {
        let now = Utc::now();
        let sub = StoredSubscription::signup("tenant_1", now);
        assert_eq!(sub.plan, PlanId::Free);
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.ends_at, Some(now + Duration::days(14)));
        assert!(sub.is_active());
        assert_eq!(sub.trial_days_remaining(now), Some(14));
    }

    #[test]
    fn test_lifecycle_transitions() {
        use SubscriptionStatus::*;

        assert!(Incomplete.can_transition_to(Active));
        assert!(Incomplete.can_transition_to(Trialing));
        assert!(Trialing.can_transition_to(Active));
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(PastDue.can_transition_to(Canceled));
        assert!(Active.can_transition_to(Active));

        assert!(!Active.can_transition_to(Trialing));
        assert!(!Active.can_transition_to(Incomplete));
        assert!(!Canceled.can_transition_to(Active));
        assert!(!Canceled.can_transition_to(PastDue));

        assert!(SubscriptionStatus::can_restart_as(Incomplete));
        assert!(SubscriptionStatus::can_restart_as(Trialing));
        assert!(!SubscriptionStatus::can_restart_as(PastDue));
    }

    #[test]
    fn test_status_parse_is_total() {
        for value in ["active", "canceled", "past_due", "trialing", "incomplete"] {
            assert_eq!(SubscriptionStatus::parse_lossy(value).as_str(), value);
        }
        assert_eq!(
            SubscriptionStatus::parse_lossy("unpaid"),
            SubscriptionStatus::Incomplete
        );
    }

    #[test]
    fn test_is_lapsed() {
        let now = Utc::now();
        let cutoff = now - Duration::days(30);

        assert!(paid("a", SubscriptionStatus::PastDue, now - Duration::days(31)).is_lapsed(cutoff));
        assert!(paid("a", SubscriptionStatus::Canceled, now - Duration::days(31)).is_lapsed(cutoff));
        assert!(!paid("a", SubscriptionStatus::PastDue, now - Duration::days(29)).is_lapsed(cutoff));
        assert!(!paid("a", SubscriptionStatus::Active, now - Duration::days(31)).is_lapsed(cutoff));

        let mut free = paid("a", SubscriptionStatus::Canceled, now - Duration::days(31));
        free.plan = PlanId::Free;
        assert!(!free.is_lapsed(cutoff));
    }

    #[test]
    fn test_customer_ids_per_provider() {
        let mut sub = StoredSubscription::signup("t", Utc::now());
        sub.set_customer_id(ProviderKind::MercadoPago, "mp_1");
        assert_eq!(sub.customer_id(ProviderKind::MercadoPago), Some("mp_1"));
        assert_eq!(sub.customer_id(ProviderKind::Stripe), None);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!("Stripe".parse::<ProviderKind>().unwrap(), ProviderKind::Stripe);
        assert_eq!(
            "mercado_pago".parse::<ProviderKind>().unwrap(),
            ProviderKind::MercadoPago
        );
        assert!("paypal".parse::<ProviderKind>().is_err());
    }

    #[tokio::test]
    async fn test_in_memory_subscription_roundtrip() {
        let store = InMemoryBillingStore::new();
        let mut sub = StoredSubscription::signup("tenant_1", Utc::now());
        sub.provider = Some(ProviderKind::Stripe);
        sub.provider_subscription_id = Some("sub_1".to_string());
        store.save_subscription(&sub).await.unwrap();

        assert_eq!(store.get_subscription("tenant_1").await.unwrap(), Some(sub.clone()));
        assert!(store.has_tenant("tenant_1"));

        let found = store
            .find_by_provider_subscription(ProviderKind::Stripe, "sub_1")
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.tenant_id), Some("tenant_1".to_string()));

        let other = store
            .find_by_provider_subscription(ProviderKind::MercadoPago, "sub_1")
            .await
            .unwrap();
        assert!(other.is_none());

        store.delete_subscription("tenant_1").await.unwrap();
        assert!(store.delete_subscription("tenant_1").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_usage_since() {
        let store = InMemoryBillingStore::new();
        let now = Utc::now();
        store.add_usage("t", ResourceKind::Transaction, 3, now - Duration::days(40));
        store.add_usage("t", ResourceKind::Transaction, 2, now);

        assert_eq!(store.count("t", ResourceKind::Transaction, None).await.unwrap(), 5);
        assert_eq!(
            store
                .count("t", ResourceKind::Transaction, Some(now - Duration::days(1)))
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.count("t", ResourceKind::Patient, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_in_memory_event_idempotency() {
        let store = InMemoryBillingStore::new();
        assert!(!store.is_event_processed(ProviderKind::Stripe, "evt_1").await.unwrap());
        store.mark_event_processed(ProviderKind::Stripe, "evt_1").await.unwrap();
        assert!(store.is_event_processed(ProviderKind::Stripe, "evt_1").await.unwrap());
        assert!(!store
            .is_event_processed(ProviderKind::MercadoPago, "evt_1")
            .await
            .unwrap());
    }
}
