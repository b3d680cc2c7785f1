//! Billing provider abstraction.
//!
//! Each provider (Stripe, MercadoPago) is wrapped by an adapter exposing the
//! same narrow set of operations. Provider-specific payloads never leave the
//! adapter; callers only see the internal vocabulary.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::error::{BillingError, BillingResult};
use super::plans::PlanId;
use super::storage::{Billable, ProviderKind, StoredSubscription, SubscriptionStatus};

/// Redirect targets for a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutUrls {
    pub success_url: String,
    pub cancel_url: String,
}

/// A started checkout the user must complete at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutHandle {
    pub session_id: String,
    pub session_url: String,
}

/// Operations every billing provider adapter supports.
#[async_trait]
pub trait BillingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Create or fetch the provider customer for a tenant.
    ///
    /// Idempotent: the id is stored on the tenant's subscription the first
    /// time and returned from there afterwards.
    async fn ensure_customer(&self, tenant: &dyn Billable) -> BillingResult<String>;

    /// Create a provider checkout for `plan`.
    ///
    /// Fails with [`BillingError::PlanNotAvailable`] when the plan has no
    /// provider price. Does not change the subscription status; that happens
    /// when the provider confirms through a webhook.
    async fn start_checkout(
        &self,
        tenant: &dyn Billable,
        plan: PlanId,
        urls: &CheckoutUrls,
    ) -> BillingResult<CheckoutHandle>;

    /// Cancel the tenant's active provider subscription.
    ///
    /// Fails with [`BillingError::NoActiveSubscription`] if there is none.
    async fn cancel(
        &self,
        tenant: &dyn Billable,
        at_period_end: bool,
    ) -> BillingResult<StoredSubscription>;

    /// Translate a provider status string.
    fn map_status(&self, provider_status: &str) -> SubscriptionStatus;
}

/// The configured provider adapters.
///
/// A provider without credentials is absent; asking for it yields
/// [`BillingError::ProviderNotConfigured`].
#[derive(Clone, Default)]
pub struct Providers {
    stripe: Option<Arc<dyn BillingProvider>>,
    mercadopago: Option<Arc<dyn BillingProvider>>,
}

impl Providers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its own kind.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn BillingProvider>) -> Self {
        match provider.kind() {
            ProviderKind::Stripe => self.stripe = Some(provider),
            ProviderKind::MercadoPago => self.mercadopago = Some(provider),
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> BillingResult<Arc<dyn BillingProvider>> {
        let provider = match kind {
            ProviderKind::Stripe => self.stripe.clone(),
            ProviderKind::MercadoPago => self.mercadopago.clone(),
        };
        provider.ok_or_else(|| BillingError::ProviderNotConfigured {
            provider: kind.to_string(),
        })
    }

    #[must_use]
    pub fn is_configured(&self, kind: ProviderKind) -> bool {
        self.get(kind).is_ok()
    }

    /// Provider used when a request does not name one: Stripe if configured,
    /// otherwise MercadoPago, otherwise Stripe (which then reports not configured).
    #[must_use]
    pub fn default_kind(&self) -> ProviderKind {
        if self.stripe.is_none() && self.mercadopago.is_some() {
            ProviderKind::MercadoPago
        } else {
            ProviderKind::Stripe
        }
    }

    /// Resolve an explicit or default provider.
    pub fn resolve(&self, kind: Option<ProviderKind>) -> BillingResult<Arc<dyn BillingProvider>> {
        self.get(kind.unwrap_or_else(|| self.default_kind()))
    }
}
