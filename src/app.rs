use std::sync::Arc;

use axum::extract::FromRef;

use crate::auth::{JwtVerifier, TenantVerifier};
use crate::billing::{
    CheckoutConfig, EntitlementsManager, MercadoPagoWebhookHandler, Providers,
    StripeWebhookHandler, SubscriptionManager,
};

/// Shared state handed to every request handler
///
/// Everything inside is reference counted, so cloning per request is cheap.
#[derive(Clone)]
pub struct AppState {
    pub entitlements: EntitlementsManager,
    pub subscriptions: SubscriptionManager,
    pub providers: Providers,
    pub checkout: Arc<CheckoutConfig>,
    /// `None` when the Stripe webhook secret is not configured.
    pub stripe_webhooks: Option<Arc<StripeWebhookHandler>>,
    /// `None` when the MercadoPago webhook secret is not configured.
    pub mercadopago_webhooks: Option<Arc<MercadoPagoWebhookHandler>>,
    pub verifier: TenantVerifier,
}

impl AppState {
    /// Builder pattern for constructing AppState
    pub fn builder(
        entitlements: EntitlementsManager,
        subscriptions: SubscriptionManager,
        jwt_secret: &[u8],
    ) -> AppStateBuilder {
        AppStateBuilder::new(entitlements, subscriptions, jwt_secret)
    }
}

impl FromRef<AppState> for TenantVerifier {
    fn from_ref(state: &AppState) -> Self {
        state.verifier.clone()
    }
}

/// Builder for AppState
#[must_use = "builder does nothing until you call build()"]
pub struct AppStateBuilder {
    entitlements: EntitlementsManager,
    subscriptions: SubscriptionManager,
    providers: Providers,
    checkout: CheckoutConfig,
    stripe_webhooks: Option<Arc<StripeWebhookHandler>>,
    mercadopago_webhooks: Option<Arc<MercadoPagoWebhookHandler>>,
    verifier: TenantVerifier,
}

impl AppStateBuilder {
    pub fn new(
        entitlements: EntitlementsManager,
        subscriptions: SubscriptionManager,
        jwt_secret: &[u8],
    ) -> Self {
        Self {
            entitlements,
            subscriptions,
            providers: Providers::new(),
            checkout: CheckoutConfig::default(),
            stripe_webhooks: None,
            mercadopago_webhooks: None,
            verifier: Arc::new(JwtVerifier::from_secret(jwt_secret)),
        }
    }

    /// Set the configured provider adapters
    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    /// Set checkout redirect handling
    pub fn with_checkout(mut self, checkout: CheckoutConfig) -> Self {
        self.checkout = checkout;
        self
    }

    pub fn with_stripe_webhooks(mut self, handler: StripeWebhookHandler) -> Self {
        self.stripe_webhooks = Some(Arc::new(handler));
        self
    }

    pub fn with_mercadopago_webhooks(mut self, handler: MercadoPagoWebhookHandler) -> Self {
        self.mercadopago_webhooks = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> AppState {
        AppState {
            entitlements: self.entitlements,
            subscriptions: self.subscriptions,
            providers: self.providers,
            checkout: Arc::new(self.checkout),
            stripe_webhooks: self.stripe_webhooks,
            mercadopago_webhooks: self.mercadopago_webhooks,
            verifier: self.verifier,
        }
    }
}
