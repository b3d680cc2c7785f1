//! Entitlements and subscription state.
//!
//! Plans, the per-tenant subscription record, the entitlement evaluator, the
//! Stripe and MercadoPago adapters, provider webhooks and the retention sweep.
//!
//! # Example
//!
//! ```rust,ignore
//! use clinify_billing::billing::{EntitlementsManager, PlanCatalog, ResourceKind};
//!
//! let entitlements = EntitlementsManager::new(
//!     Arc::new(PlanCatalog::standard()),
//!     store.clone(),
//!     usage.clone(),
//! );
//!
//! let check = entitlements.can_create(&tenant_id, ResourceKind::Patient).await;
//! if !check.allowed {
//!     return Err(BillingError::ResourceQuotaExceeded {
//!         resource: "patient".into(),
//!         current: check.current,
//!         limit: check.limit,
//!     }
//!     .into());
//! }
//! ```

pub mod checkout;
pub mod entitlements;
pub mod error;
pub mod mercadopago;
pub mod plans;
pub mod provider;
pub mod retention;
#[cfg(feature = "database")]
pub mod sea_orm_store;
pub mod storage;
pub mod stripe;
pub mod subscription;
pub mod webhook;

// Plan exports
pub use plans::{
    LimitCheckResult, Module, ModuleAccess, PlanCatalog, PlanDefinition, PlanId, PlanLimits,
    PlanModules, ResourceKind, UNLIMITED,
};

// Storage exports
pub use storage::{
    Billable, BillingStore, ProviderKind, StoredSubscription, SubscriptionStatus, TRIAL_DAYS,
    TenantStore, UsageStore,
};

// Entitlement exports
pub use entitlements::{
    Entitlements, EntitlementsManager, QuotaCheck, ResolvedPlan, UsageSummary, month_start,
};

// Subscription exports
pub use subscription::{ProviderSubscriptionUpdate, SubscriptionManager, TransitionOutcome};

// Provider exports
pub use checkout::CheckoutConfig;
pub use mercadopago::{MercadoPagoAdapter, MercadoPagoPrices, MercadoPagoWebhookHandler};
pub use provider::{BillingProvider, CheckoutHandle, CheckoutUrls, Providers};
pub use stripe::{StripeAdapter, StripePrices, StripeWebhookHandler};

// Webhook exports
pub use webhook::WebhookOutcome;

// Retention exports
pub use retention::{RetentionJob, SweepReport};

// Error exports
pub use error::{BillingError, BillingResult};

#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmBillingStore;

#[cfg(any(test, feature = "test-billing"))]
pub use storage::test::InMemoryBillingStore;
