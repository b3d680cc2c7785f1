//! Expired-data retention.
//!
//! Tenants whose paid subscription lapsed (canceled or past due) more than the
//! grace period ago are deleted together with everything they own.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::error::BillingResult;
use super::storage::{BillingStore, TenantStore};

/// Default grace period after a paid subscription lapses.
pub const DEFAULT_GRACE_DAYS: i64 = 30;

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub deleted_count: usize,
    pub error_count: usize,
}

/// Deletes tenants whose paid subscription lapsed past the grace period.
#[derive(Clone)]
pub struct RetentionJob {
    store: Arc<dyn BillingStore>,
    tenants: Arc<dyn TenantStore>,
    grace: Duration,
}

impl RetentionJob {
    #[must_use]
    pub fn new(store: Arc<dyn BillingStore>, tenants: Arc<dyn TenantStore>) -> Self {
        Self {
            store,
            tenants,
            grace: Duration::days(DEFAULT_GRACE_DAYS),
        }
    }

    #[must_use]
    pub fn with_grace_days(mut self, days: i64) -> Self {
        self.grace = Duration::days(days);
        self
    }

    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Run one sweep.
    ///
    /// Failing to list candidates is an error; a failure on one tenant is
    /// logged and counted and the sweep moves on.
    pub async fn sweep(&self, now: DateTime<Utc>) -> BillingResult<SweepReport> {
        let cutoff = now - self.grace;
        let lapsed = self.store.list_lapsed(cutoff).await?;
        let mut report = SweepReport::default();

        for sub in lapsed {
            let result: crate::error::Result<()> = async {
                self.store.delete_subscription(&sub.tenant_id).await?;
                self.tenants.delete_tenant(&sub.tenant_id).await
            }
            .await;

            match result {
                Ok(()) => {
                    report.deleted_count += 1;
                    tracing::info!(
                        target: "clinify::billing::retention",
                        tenant_id = %sub.tenant_id,
                        plan = %sub.plan,
                        status = %sub.status,
                        ends_at = ?sub.ends_at,
                        "Deleted lapsed tenant"
                    );
                }
                Err(e) => {
                    report.error_count += 1;
                    tracing::error!(
                        target: "clinify::billing::retention",
                        tenant_id = %sub.tenant_id,
                        error = %e,
                        "Failed to delete lapsed tenant"
                    );
                }
            }
        }

        tracing::info!(
            target: "clinify::billing::retention",
            cutoff = %cutoff,
            deleted = report.deleted_count,
            errors = report.error_count,
            "Retention sweep finished"
        );

        Ok(report)
    }
}
