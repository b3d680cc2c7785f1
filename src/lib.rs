//! Clinify billing - entitlements and subscription state
//!
//! Decides what each clinic (tenant) may do under its plan, keeps the
//! tenant's subscription record in step with Stripe and MercadoPago, and
//! removes data of tenants whose paid subscription lapsed long ago.
//!
//! # Features
//!
//! - **Entitlements**: plan catalog, module access and resource quotas
//! - **Providers**: Stripe and MercadoPago checkout and cancellation
//! - **Webhooks**: signature-verified, idempotent provider event handling
//! - **Retention**: periodic sweep of lapsed tenants
//! - **Database**: SeaORM-backed stores (`database` feature)
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use clinify_billing::{App, AppState, ConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigBuilder::new().from_env().build()?;
//!     clinify_billing::init_tracing_with_config(&config);
//!
//!     let state = AppState::builder(entitlements, subscriptions, b"secret").build();
//!     App::with_billing_routes(state).serve(config.server.addr()?).await?;
//!     Ok(())
//! }
//! ```

mod app;
pub mod auth;
pub mod billing;
mod config;
mod core;
mod error;
pub mod health;
pub mod http;
pub mod jobs;
pub mod utils;

// Re-exports for public API
pub use app::{AppState, AppStateBuilder};
pub use config::{
    BillingConfig, Config, ConfigBuilder, LoggingConfig, MercadoPagoConfig, RetentionConfig,
    ServerConfig, StripeConfig,
};
pub use core::App;
pub use error::{ClinifyError, Result};
pub use http::{RouteModule, ValidatedJson};

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging with sensible defaults
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "clinify::billing=debug")
/// - `CLINIFY_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = utils::get_env_with_prefix("LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    init_subscriber(env_filter, json_logs);
}

/// Initialize tracing with a custom configuration
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    init_subscriber(env_filter, config.logging.json);
}

fn init_subscriber(env_filter: EnvFilter, json: bool) {
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
