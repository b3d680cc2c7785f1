use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;

use clinify_billing::billing::mercadopago::{LiveMercadoPagoApi, LiveMercadoPagoApiConfig};
use clinify_billing::billing::stripe::{LiveStripeApi, LiveStripeApiConfig};
use clinify_billing::billing::{
    BillingStore, EntitlementsManager, MercadoPagoAdapter, MercadoPagoWebhookHandler, PlanCatalog,
    Providers, RetentionJob, SeaOrmBillingStore, StripeAdapter, StripeWebhookHandler,
    SubscriptionManager,
};
use clinify_billing::jobs::RetentionScheduler;
use clinify_billing::{App, AppState, ConfigBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .from_env()
        .build()
        .context("invalid configuration")?;
    clinify_billing::init_tracing_with_config(&config);

    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    let jwt_secret = config
        .jwt_secret
        .as_ref()
        .context("JWT_SECRET is not set")?;

    let db = sea_orm::Database::connect(database_url)
        .await
        .context("failed to connect to database")?;
    let store = Arc::new(SeaOrmBillingStore::new(db));
    let billing_store: Arc<dyn BillingStore> = store.clone();

    let subscriptions = SubscriptionManager::new(billing_store.clone());
    let entitlements = EntitlementsManager::new(
        Arc::new(PlanCatalog::standard()),
        billing_store.clone(),
        store.clone(),
    );

    let timeout = config.billing.provider_timeout_seconds;
    let mut providers = Providers::new();
    let mut state = AppState::builder(
        entitlements,
        subscriptions.clone(),
        jwt_secret.expose_secret().as_bytes(),
    )
    .with_checkout(config.billing.checkout());

    match &config.billing.stripe {
        Some(stripe) => {
            let live = LiveStripeApi::new(
                stripe.secret_key.clone(),
                LiveStripeApiConfig::new().timeout_seconds(timeout),
            );
            match live {
                Ok(api) => {
                    tracing::info!(
                        target: "clinify::billing::stripe",
                        test_mode = api.is_test_mode(),
                        "Stripe enabled"
                    );
                    providers = providers.with(Arc::new(StripeAdapter::new(
                        Arc::new(api),
                        subscriptions.clone(),
                        stripe.prices(),
                    )));
                    match &stripe.webhook_secret {
                        Some(secret) => {
                            state = state.with_stripe_webhooks(StripeWebhookHandler::new(
                                billing_store.clone(),
                                secret.clone(),
                                stripe.prices(),
                            ));
                        }
                        None => tracing::warn!(
                            target: "clinify::billing::stripe",
                            "STRIPE_WEBHOOK_SECRET not set; Stripe webhooks are disabled"
                        ),
                    }
                }
                Err(e) => tracing::error!(
                    target: "clinify::billing::stripe",
                    error = %e,
                    "Stripe disabled: invalid configuration"
                ),
            }
        }
        None => tracing::warn!(
            target: "clinify::billing::stripe",
            "STRIPE_SECRET_KEY not set; Stripe is disabled"
        ),
    }

    match &config.billing.mercadopago {
        Some(mp) => {
            let live = LiveMercadoPagoApi::new(
                mp.access_token.clone(),
                LiveMercadoPagoApiConfig::new().timeout_seconds(timeout),
            );
            match live {
                Ok(api) => {
                    tracing::info!(
                        target: "clinify::billing::mercadopago",
                        test_mode = api.is_test_mode(),
                        "MercadoPago enabled"
                    );
                    let api = Arc::new(api);
                    providers = providers.with(Arc::new(MercadoPagoAdapter::new(
                        api.clone(),
                        subscriptions.clone(),
                        mp.prices(),
                    )));
                    match &mp.webhook_secret {
                        Some(secret) => {
                            state = state.with_mercadopago_webhooks(MercadoPagoWebhookHandler::new(
                                api,
                                billing_store.clone(),
                                secret.clone(),
                                mp.prices(),
                            ));
                        }
                        None => tracing::warn!(
                            target: "clinify::billing::mercadopago",
                            "MERCADOPAGO_WEBHOOK_SECRET not set; MercadoPago webhooks are disabled"
                        ),
                    }
                }
                Err(e) => tracing::error!(
                    target: "clinify::billing::mercadopago",
                    error = %e,
                    "MercadoPago disabled: invalid configuration"
                ),
            }
        }
        None => tracing::warn!(
            target: "clinify::billing::mercadopago",
            "MERCADOPAGO_ACCESS_TOKEN not set; MercadoPago is disabled"
        ),
    }

    let state = state.with_providers(providers).build();

    let retention = RetentionJob::new(billing_store, store)
        .with_grace_days(config.retention.grace_days);
    let scheduler = RetentionScheduler::new(
        retention,
        tokio::time::Duration::from_secs(config.retention.interval_hours * 3600),
    )
    .spawn();

    let addr = config.server.addr().context("invalid server address")?;
    let served = App::with_billing_routes(state).serve(addr).await;

    scheduler.shutdown().await;
    served.context("server error")
}
