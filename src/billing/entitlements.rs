//! Entitlements and quota gating.
//!
//! Resolves a tenant's effective plan and answers quota and module-access
//! questions by combining the [`PlanCatalog`] with live usage counts.
//!
//! Read-side checks favor availability: if the subscription cannot be read the
//! tenant is evaluated on the `free` plan, and if a usage count fails the
//! creation is denied. Both cases set `degraded` on the answer and log a
//! warning.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use super::error::{BillingError, BillingResult};
use super::plans::{Module, PlanCatalog, PlanId, PlanLimits, PlanModules, ResourceKind};
use super::storage::{BillingStore, StoredSubscription, SubscriptionStatus, UsageStore};

/// The plan a tenant is evaluated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedPlan {
    pub plan: PlanId,
    /// Stored subscription status, if a subscription exists.
    pub status: Option<SubscriptionStatus>,
    /// The subscription could not be read; `plan` is the free fallback.
    pub degraded: bool,
}

impl ResolvedPlan {
    fn from_subscription(sub: Option<&StoredSubscription>) -> Self {
        let plan = match sub {
            Some(sub) if sub.is_active() => sub.plan,
            _ => PlanId::Free,
        };
        Self {
            plan,
            status: sub.map(|s| s.status),
            degraded: false,
        }
    }

    fn degraded() -> Self {
        Self {
            plan: PlanId::Free,
            status: None,
            degraded: true,
        }
    }
}

/// Answer to "may this tenant create one more resource?".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCheck {
    pub allowed: bool,
    pub current: i64,
    /// `-1` when unlimited.
    pub limit: i64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// Usage against every quota.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub patients: QuotaCheck,
    pub users: QuotaCheck,
    pub appointments_this_month: QuotaCheck,
    pub transactions_this_month: QuotaCheck,
}

/// Snapshot of a tenant's plan, limits, modules and usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlements {
    pub plan: PlanId,
    /// The plan stored on the subscription, even when it is not in effect.
    pub subscribed_plan: Option<PlanId>,
    pub status: Option<SubscriptionStatus>,
    pub ends_at: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub degraded: bool,
    pub limits: PlanLimits,
    pub modules: PlanModules,
    pub usage: UsageSummary,
}

/// Start of the calendar month containing `now`, on the server's local clock.
#[must_use]
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let first = NaiveDate::from_ymd_opt(local.year(), local.month(), 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0));

    match first {
        Some(first) => match Local.from_local_datetime(&first).earliest() {
            Some(start) => start.with_timezone(&Utc),
            None => first.and_utc(),
        },
        None => now,
    }
}

/// Entitlements evaluator.
///
/// Holds the shared plan catalog and the stores it reads. Cheap to clone.
#[derive(Clone)]
pub struct EntitlementsManager {
    catalog: Arc<PlanCatalog>,
    store: Arc<dyn BillingStore>,
    usage: Arc<dyn UsageStore>,
}

impl EntitlementsManager {
    #[must_use]
    pub fn new(
        catalog: Arc<PlanCatalog>,
        store: Arc<dyn BillingStore>,
        usage: Arc<dyn UsageStore>,
    ) -> Self {
        Self {
            catalog,
            store,
            usage,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Resolve the plan a tenant is evaluated on, propagating store errors.
    pub async fn try_resolve_plan(&self, tenant_id: &str) -> BillingResult<PlanId> {
        let sub = self.store.get_subscription(tenant_id).await?;
        Ok(ResolvedPlan::from_subscription(sub.as_ref()).plan)
    }

    /// Resolve the plan a tenant is evaluated on.
    ///
    /// Never fails. A tenant without an active or trialing subscription is on
    /// `free`; a store error also yields `free`, flagged as degraded.
    pub async fn resolve_plan(&self, tenant_id: &str) -> ResolvedPlan {
        self.load(tenant_id).await.0
    }

    async fn load(&self, tenant_id: &str) -> (ResolvedPlan, Option<StoredSubscription>) {
        match self.store.get_subscription(tenant_id).await {
            Ok(sub) => (ResolvedPlan::from_subscription(sub.as_ref()), sub),
            Err(e) => {
                tracing::warn!(
                    target: "clinify::billing",
                    tenant_id = %tenant_id,
                    error = %e,
                    "Failed to read subscription, evaluating tenant on the free plan"
                );
                (ResolvedPlan::degraded(), None)
            }
        }
    }

    pub async fn get_limits(&self, tenant_id: &str) -> PlanLimits {
        let resolved = self.resolve_plan(tenant_id).await;
        self.catalog.get(resolved.plan).limits.clone()
    }

    pub async fn get_modules(&self, tenant_id: &str) -> PlanModules {
        let resolved = self.resolve_plan(tenant_id).await;
        self.catalog.get(resolved.plan).modules.clone()
    }

    /// Module is enabled at any level.
    pub async fn has_module_access(&self, tenant_id: &str, module: Module) -> bool {
        self.get_modules(tenant_id).await.get(module).is_enabled()
    }

    /// Module is enabled at its full level.
    pub async fn has_advanced_access(&self, tenant_id: &str, module: Module) -> bool {
        self.get_modules(tenant_id).await.get(module).is_advanced()
    }

    /// Check whether the tenant may create one more `kind`.
    pub async fn can_create(&self, tenant_id: &str, kind: ResourceKind) -> QuotaCheck {
        self.can_create_at(tenant_id, kind, Utc::now()).await
    }

    /// [`can_create`](Self::can_create) with an explicit clock for the month window.
    pub async fn can_create_at(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> QuotaCheck {
        let resolved = self.resolve_plan(tenant_id).await;
        let limits = &self.catalog.get(resolved.plan).limits;
        self.check_quota(tenant_id, limits, kind, now, resolved.degraded)
            .await
    }

    async fn check_quota(
        &self,
        tenant_id: &str,
        limits: &PlanLimits,
        kind: ResourceKind,
        now: DateTime<Utc>,
        degraded: bool,
    ) -> QuotaCheck {
        let limit = limits.get(kind);
        let since = kind.is_monthly().then(|| month_start(now));

        match self.usage.count(tenant_id, kind, since).await {
            Ok(current) => {
                let check = limits.check(kind, current);
                QuotaCheck {
                    allowed: check.is_allowed(),
                    current,
                    limit,
                    degraded,
                }
            }
            Err(e) => {
                tracing::warn!(
                    target: "clinify::billing",
                    tenant_id = %tenant_id,
                    resource = %kind,
                    error = %e,
                    "Failed to count usage, denying creation"
                );
                QuotaCheck {
                    allowed: false,
                    current: 0,
                    limit,
                    degraded: true,
                }
            }
        }
    }

    /// Like [`can_create`](Self::can_create) but fails with
    /// [`BillingError::ResourceQuotaExceeded`] when creation is not allowed.
    pub async fn require_quota(
        &self,
        tenant_id: &str,
        kind: ResourceKind,
    ) -> BillingResult<QuotaCheck> {
        let check = self.can_create(tenant_id, kind).await;
        if check.allowed {
            Ok(check)
        } else {
            Err(BillingError::ResourceQuotaExceeded {
                resource: kind.as_str().to_string(),
                current: check.current,
                limit: check.limit,
            })
        }
    }

    /// Full entitlement snapshot.
    pub async fn get_entitlements(&self, tenant_id: &str) -> Entitlements {
        self.get_entitlements_at(tenant_id, Utc::now()).await
    }

    pub async fn get_entitlements_at(&self, tenant_id: &str, now: DateTime<Utc>) -> Entitlements {
        let (resolved, sub) = self.load(tenant_id).await;
        let definition = self.catalog.get(resolved.plan);
        let limits = &definition.limits;

        let (patients, users, appointments, transactions) = tokio::join!(
            self.check_quota(tenant_id, limits, ResourceKind::Patient, now, resolved.degraded),
            self.check_quota(tenant_id, limits, ResourceKind::User, now, resolved.degraded),
            self.check_quota(tenant_id, limits, ResourceKind::Appointment, now, resolved.degraded),
            self.check_quota(tenant_id, limits, ResourceKind::Transaction, now, resolved.degraded),
        );

        Entitlements {
            plan: resolved.plan,
            subscribed_plan: sub.as_ref().map(|s| s.plan),
            status: resolved.status,
            ends_at: sub.as_ref().and_then(|s| s.ends_at),
            cancel_at_period_end: sub.as_ref().is_some_and(|s| s.cancel_at_period_end),
            degraded: resolved.degraded,
            limits: limits.clone(),
            modules: definition.modules.clone(),
            usage: UsageSummary {
                patients,
                users,
                appointments_this_month: appointments,
                transactions_this_month: transactions,
            },
        }
    }
}
