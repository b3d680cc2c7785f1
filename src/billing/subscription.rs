//! Subscription record lifecycle.
//!
//! Creates the signup record and applies provider-driven changes to it,
//! enforcing the status state machine:
//!
//! ```text
//! incomplete -> trialing | active | canceled
//! trialing   -> active | past_due | canceled
//! active    <-> past_due
//! active | trialing | past_due -> canceled
//! ```
//!
//! `canceled` is terminal for the provider object that produced it. A new
//! provider object (a different provider subscription id) may start the record
//! again as `incomplete`, `trialing` or `active`.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::{BillingError, BillingResult};
use super::plans::PlanId;
use super::storage::{BillingStore, ProviderKind, StoredSubscription, SubscriptionStatus};

/// A provider's view of one of its subscription objects, already translated
/// into the internal vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscriptionUpdate {
    pub tenant_id: String,
    pub provider: ProviderKind,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    /// Plan the object is billed for, when the provider reports it.
    pub plan: Option<PlanId>,
    pub customer_id: Option<String>,
    /// End of the current paid period.
    pub period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl ProviderSubscriptionUpdate {
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        provider: ProviderKind,
        provider_subscription_id: impl Into<String>,
        status: SubscriptionStatus,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            provider,
            provider_subscription_id: provider_subscription_id.into(),
            status,
            plan: None,
            customer_id: None,
            period_end: None,
            cancel_at_period_end: None,
            canceled_at: None,
        }
    }

    #[must_use]
    pub fn plan(mut self, plan: PlanId) -> Self {
        self.plan = Some(plan);
        self
    }

    #[must_use]
    pub fn customer_id(mut self, customer_id: impl Into<String>) -> Self {
        self.customer_id = Some(customer_id.into());
        self
    }

    #[must_use]
    pub fn period_end(mut self, period_end: DateTime<Utc>) -> Self {
        self.period_end = Some(period_end);
        self
    }

    #[must_use]
    pub fn cancel_at_period_end(mut self, cancel: bool) -> Self {
        self.cancel_at_period_end = Some(cancel);
        self
    }
}

/// Result of applying a provider update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The record was updated.
    Applied(StoredSubscription),
    /// The update would break the lifecycle and was dropped.
    Rejected {
        from: SubscriptionStatus,
        to: SubscriptionStatus,
    },
}

impl TransitionOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Manages subscription records.
#[derive(Clone)]
pub struct SubscriptionManager {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, tenant_id: &str) -> BillingResult<Option<StoredSubscription>> {
        Ok(self.store.get_subscription(tenant_id).await?)
    }

    /// Create the signup record (free, trialing, 14 days).
    ///
    /// A tenant has at most one subscription: if a record exists it is
    /// returned unchanged.
    pub async fn create_signup(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<StoredSubscription> {
        if tenant_id.trim().is_empty() {
            return Err(BillingError::validation("tenant id cannot be empty"));
        }

        if let Some(existing) = self.store.get_subscription(tenant_id).await? {
            return Ok(existing);
        }

        let sub = StoredSubscription::signup(tenant_id, now);
        self.store.save_subscription(&sub).await?;

        tracing::info!(
            target: "clinify::billing",
            tenant_id = %tenant_id,
            ends_at = ?sub.ends_at,
            "Created signup subscription"
        );

        Ok(sub)
    }

    /// Get the tenant's record, creating the signup record if it has none.
    pub async fn get_or_create(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<StoredSubscription> {
        self.create_signup(tenant_id, now).await
    }

    /// Store a provider customer id on the tenant's record.
    pub async fn link_customer(
        &self,
        tenant_id: &str,
        provider: ProviderKind,
        customer_id: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<StoredSubscription> {
        let mut sub = self.get_or_create(tenant_id, now).await?;
        if sub.customer_id(provider) == Some(customer_id) {
            return Ok(sub);
        }

        sub.set_customer_id(provider, customer_id);
        sub.updated_at = now;
        self.store.save_subscription(&sub).await?;

        tracing::debug!(
            target: "clinify::billing",
            tenant_id = %tenant_id,
            provider = %provider,
            "Linked provider customer"
        );

        Ok(sub)
    }

    /// Apply a provider's view of its subscription object.
    ///
    /// Updates that break the lifecycle are rejected and leave the record
    /// untouched.
    pub async fn apply_provider_update(
        &self,
        update: ProviderSubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> BillingResult<TransitionOutcome> {
        let mut sub = self.get_or_create(&update.tenant_id, now).await?;
        let from = sub.status;
        let to = update.status;

        let same_object = sub.provider == Some(update.provider)
            && sub.provider_subscription_id.as_deref() == Some(update.provider_subscription_id.as_str());

        let allowed = if same_object {
            from.can_transition_to(to)
        } else {
            // A pending object must not displace one that currently grants the plan.
            let displaces_entitled = sub.provider_subscription_id.is_some()
                && from.is_entitled()
                && to == SubscriptionStatus::Incomplete;
            SubscriptionStatus::can_restart_as(to) && !displaces_entitled
        };

        if !allowed {
            tracing::warn!(
                target: "clinify::billing",
                tenant_id = %update.tenant_id,
                provider = %update.provider,
                provider_subscription_id = %update.provider_subscription_id,
                from = %from,
                to = %to,
                "Ignoring invalid subscription transition"
            );
            return Ok(TransitionOutcome::Rejected { from, to });
        }

        if !same_object {
            sub.provider = Some(update.provider);
            sub.provider_subscription_id = Some(update.provider_subscription_id.clone());
            sub.started_at = now;
            sub.cancel_at_period_end = false;
            sub.canceled_at = None;
        }

        sub.status = to;
        if let Some(plan) = update.plan {
            sub.plan = plan;
        }
        if let Some(customer_id) = update.customer_id {
            sub.set_customer_id(update.provider, customer_id);
        }
        if let Some(period_end) = update.period_end {
            sub.ends_at = Some(period_end);
        }
        if let Some(cancel) = update.cancel_at_period_end {
            sub.cancel_at_period_end = cancel;
        }
        if to == SubscriptionStatus::Canceled {
            let canceled_at = update.canceled_at.or(sub.canceled_at).unwrap_or(now);
            sub.canceled_at = Some(canceled_at);
            if sub.ends_at.is_none_or(|end| end > canceled_at) {
                sub.ends_at = Some(canceled_at);
            }
        }
        sub.updated_at = now;

        self.store.save_subscription(&sub).await?;

        tracing::info!(
            target: "clinify::billing",
            tenant_id = %sub.tenant_id,
            provider = %update.provider,
            plan = %sub.plan,
            from = %from,
            to = %to,
            "Applied subscription update"
        );

        Ok(TransitionOutcome::Applied(sub))
    }

    /// Move the record linked to a provider object from `expected` to `next`.
    ///
    /// Returns `None` when no record is linked to the object or its status is
    /// not `expected`.
    pub async fn transition_linked(
        &self,
        provider: ProviderKind,
        provider_subscription_id: &str,
        expected: SubscriptionStatus,
        next: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> BillingResult<Option<StoredSubscription>> {
        let Some(sub) = self
            .store
            .find_by_provider_subscription(provider, provider_subscription_id)
            .await?
        else {
            return Ok(None);
        };

        if sub.status != expected {
            return Ok(None);
        }

        let update = ProviderSubscriptionUpdate::new(
            sub.tenant_id.clone(),
            provider,
            provider_subscription_id,
            next,
        );
        match self.apply_provider_update(update, now).await? {
            TransitionOutcome::Applied(sub) => Ok(Some(sub)),
            TransitionOutcome::Rejected { .. } => Ok(None),
        }
    }

    /// Record a cancellation the provider has accepted.
    ///
    /// At period end the status is unchanged and `cancel_at_period_end` is set;
    /// otherwise the record becomes `canceled` with `canceled_at = now`.
    pub async fn record_cancellation(
        &self,
        tenant_id: &str,
        at_period_end: bool,
        now: DateTime<Utc>,
    ) -> BillingResult<StoredSubscription> {
        let mut sub = self
            .store
            .get_subscription(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NoActiveSubscription {
                tenant_id: tenant_id.to_string(),
            })?;

        if at_period_end {
            sub.cancel_at_period_end = true;
        } else {
            if !sub.status.can_transition_to(SubscriptionStatus::Canceled) {
                return Err(BillingError::InvalidTransition {
                    from: sub.status.to_string(),
                    to: SubscriptionStatus::Canceled.to_string(),
                });
            }
            sub.status = SubscriptionStatus::Canceled;
            sub.canceled_at = Some(now);
            sub.cancel_at_period_end = false;
            if sub.ends_at.is_none_or(|end| end > now) {
                sub.ends_at = Some(now);
            }
        }
        sub.updated_at = now;

        self.store.save_subscription(&sub).await?;

        tracing::info!(
            target: "clinify::billing",
            tenant_id = %tenant_id,
            at_period_end = at_period_end,
            status = %sub.status,
            "Recorded subscription cancellation"
        );

        Ok(sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::storage::test::InMemoryBillingStore;
    use chrono::Duration;

    fn manager() -> (InMemoryBillingStore, SubscriptionManager) {
        let store = InMemoryBillingStore::new();
        let manager = SubscriptionManager::new(Arc::new(store.clone()));
        (store, manager)
    }

    fn stripe_update(id: &str, status: SubscriptionStatus) -> ProviderSubscriptionUpdate {
        ProviderSubscriptionUpdate::new("tenant_1", ProviderKind::Stripe, id, status)
    }

    #[tokio::test]
    async fn test_signup_creates_one_record() {
        let (store, manager) = manager();
        let now = Utc::now();

        let first = manager.create_signup("tenant_1", now).await.unwrap();
        assert_eq!(first.plan, PlanId::Free);
        assert_eq!(first.status, SubscriptionStatus::Trialing);
        assert_eq!(first.ends_at, Some(now + Duration::days(14)));

        let second = manager
            .create_signup("tenant_1", now + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_all_subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_signup_rejects_empty_tenant() {
        let (_, manager) = manager();
        let err = manager.create_signup("  ", Utc::now()).await.unwrap_err();
        assert!(matches!(err, BillingError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_checkout_activation_links_object() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager.create_signup("tenant_1", now).await.unwrap();

        let outcome = manager
            .apply_provider_update(
                stripe_update("sub_1", SubscriptionStatus::Active)
                    .plan(PlanId::Basic)
                    .customer_id("cus_1")
                    .period_end(now + Duration::days(30)),
                now,
            )
            .await
            .unwrap();

        let TransitionOutcome::Applied(sub) = outcome else {
            panic!("expected update to apply");
        };
        assert_eq!(sub.plan, PlanId::Basic);
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.provider, Some(ProviderKind::Stripe));
        assert_eq!(sub.provider_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(sub.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(sub.ends_at, Some(now + Duration::days(30)));
    }

    #[tokio::test]
    async fn test_active_past_due_round_trip() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();

        let past_due = manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::PastDue), now)
            .await
            .unwrap();
        assert!(past_due.is_applied());

        let active = manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();
        assert!(active.is_applied());
    }

    #[tokio::test]
    async fn test_canceled_object_cannot_resurrect() {
        let (store, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Canceled), now)
            .await
            .unwrap();

        let outcome = manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Rejected {
                from: SubscriptionStatus::Canceled,
                to: SubscriptionStatus::Active
            }
        );
        let stored = store.get_subscription("tenant_1").await.unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
        assert_eq!(stored.canceled_at, Some(now));
    }

    #[tokio::test]
    async fn test_fresh_object_restarts_canceled_record() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Canceled), now)
            .await
            .unwrap();

        let later = now + Duration::days(3);
        let outcome = manager
            .apply_provider_update(stripe_update("sub_2", SubscriptionStatus::Incomplete), later)
            .await
            .unwrap();
        let TransitionOutcome::Applied(sub) = outcome else {
            panic!("fresh object should restart the record");
        };
        assert_eq!(sub.status, SubscriptionStatus::Incomplete);
        assert_eq!(sub.provider_subscription_id.as_deref(), Some("sub_2"));
        assert_eq!(sub.canceled_at, None);
        assert_eq!(sub.started_at, later);

        // A fresh object cannot start out past due.
        let outcome = manager
            .apply_provider_update(stripe_update("sub_3", SubscriptionStatus::PastDue), later)
            .await
            .unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test]
    async fn test_pending_object_does_not_displace_active_one() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();

        let pending = ProviderSubscriptionUpdate::new(
            "tenant_1",
            ProviderKind::MercadoPago,
            "pre_1",
            SubscriptionStatus::Incomplete,
        );
        let outcome = manager.apply_provider_update(pending, now).await.unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test]
    async fn test_transition_linked_requires_expected_status() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(stripe_update("sub_1", SubscriptionStatus::Active), now)
            .await
            .unwrap();

        let unchanged = manager
            .transition_linked(
                ProviderKind::Stripe,
                "sub_1",
                SubscriptionStatus::PastDue,
                SubscriptionStatus::Active,
                now,
            )
            .await
            .unwrap();
        assert!(unchanged.is_none());

        let moved = manager
            .transition_linked(
                ProviderKind::Stripe,
                "sub_1",
                SubscriptionStatus::Active,
                SubscriptionStatus::PastDue,
                now,
            )
            .await
            .unwrap();
        assert_eq!(moved.map(|s| s.status), Some(SubscriptionStatus::PastDue));

        let unknown = manager
            .transition_linked(
                ProviderKind::Stripe,
                "sub_404",
                SubscriptionStatus::Active,
                SubscriptionStatus::PastDue,
                now,
            )
            .await
            .unwrap();
        assert!(unknown.is_none());
    }

    #[tokio::test]
    async fn test_record_cancellation() {
        let (_, manager) = manager();
        let now = Utc::now();
        manager
            .apply_provider_update(
                stripe_update("sub_1", SubscriptionStatus::Active).period_end(now + Duration::days(20)),
                now,
            )
            .await
            .unwrap();

        let scheduled = manager.record_cancellation("tenant_1", true, now).await.unwrap();
        assert_eq!(scheduled.status, SubscriptionStatus::Active);
        assert!(scheduled.cancel_at_period_end);
        assert_eq!(scheduled.canceled_at, None);

        let immediate = manager.record_cancellation("tenant_1", false, now).await.unwrap();
        assert_eq!(immediate.status, SubscriptionStatus::Canceled);
        assert_eq!(immediate.canceled_at, Some(now));
        assert_eq!(immediate.ends_at, Some(now));
    }

    #[tokio::test]
    async fn test_record_cancellation_without_record() {
        let (_, manager) = manager();
        let err = manager
            .record_cancellation("ghost", false, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NoActiveSubscription { .. }));
    }
}
