use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::billing::plans::PlanId;
use crate::billing::{CheckoutConfig, MercadoPagoPrices, StripePrices};
use crate::utils::get_env_with_prefix;

/// Main configuration for the billing service
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub billing: BillingConfig,
    pub retention: RetentionConfig,
    /// HS256 secret for bearer tokens issued by the auth service.
    pub jwt_secret: Option<SecretString>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_json")]
    pub json: bool,
}

/// Billing provider configuration.
///
/// A provider section is `None` when its credentials are absent; that
/// provider is then not offered.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub stripe: Option<StripeConfig>,
    pub mercadopago: Option<MercadoPagoConfig>,
    /// Timeout for each provider API call.
    pub provider_timeout_seconds: u64,
    /// Frontend base URL used for default checkout redirects.
    pub frontend_url: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: SecretString,
    pub webhook_secret: Option<SecretString>,
    pub price_basic: Option<String>,
    pub price_professional: Option<String>,
    pub price_enterprise: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MercadoPagoConfig {
    pub access_token: SecretString,
    pub webhook_secret: Option<SecretString>,
    pub price_basic: Option<f64>,
    pub price_professional: Option<f64>,
    pub price_enterprise: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_interval_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_grace_days")]
    pub grace_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            billing: BillingConfig::default(),
            retention: RetentionConfig::default(),
            jwt_secret: None,
            database_url: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: default_json(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            stripe: None,
            mercadopago: None,
            provider_timeout_seconds: default_provider_timeout(),
            frontend_url: CheckoutConfig::default().frontend_url,
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_retention_interval_hours(),
            grace_days: default_grace_days(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_json() -> bool {
    false
}

fn default_provider_timeout() -> u64 {
    10
}

fn default_retention_interval_hours() -> u64 {
    24
}

fn default_grace_days() -> i64 {
    crate::billing::retention::DEFAULT_GRACE_DAYS
}

impl ServerConfig {
    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

impl StripeConfig {
    /// Price ids keyed by plan. Unset prices leave that plan unavailable.
    #[must_use]
    pub fn prices(&self) -> StripePrices {
        let mut prices = StripePrices::new();
        for (plan, price) in [
            (PlanId::Basic, &self.price_basic),
            (PlanId::Professional, &self.price_professional),
            (PlanId::Enterprise, &self.price_enterprise),
        ] {
            if let Some(price) = price {
                prices = prices.with_price(plan, price.clone());
            }
        }
        prices
    }

    fn from_env() -> Option<Self> {
        let secret_key = get_env_with_prefix("STRIPE_SECRET_KEY")?;
        Some(Self {
            secret_key: SecretString::from(secret_key),
            webhook_secret: get_env_with_prefix("STRIPE_WEBHOOK_SECRET").map(SecretString::from),
            price_basic: get_env_with_prefix("STRIPE_PRICE_ID_BASIC"),
            price_professional: get_env_with_prefix("STRIPE_PRICE_ID_PROFESSIONAL"),
            price_enterprise: get_env_with_prefix("STRIPE_PRICE_ID_ENTERPRISE"),
        })
    }
}

impl MercadoPagoConfig {
    /// Monthly amounts in BRL keyed by plan.
    #[must_use]
    pub fn prices(&self) -> MercadoPagoPrices {
        let mut prices = MercadoPagoPrices::new();
        for (plan, amount) in [
            (PlanId::Basic, self.price_basic),
            (PlanId::Professional, self.price_professional),
            (PlanId::Enterprise, self.price_enterprise),
        ] {
            if let Some(amount) = amount {
                prices = prices.with_price(plan, amount);
            }
        }
        prices
    }

    fn from_env() -> Option<Self> {
        let access_token = get_env_with_prefix("MERCADOPAGO_ACCESS_TOKEN")?;
        let amount = |key: &str| get_env_with_prefix(key).and_then(|v| v.parse::<f64>().ok());
        Some(Self {
            access_token: SecretString::from(access_token),
            webhook_secret: get_env_with_prefix("MERCADOPAGO_WEBHOOK_SECRET")
                .map(SecretString::from),
            price_basic: amount("MERCADOPAGO_PRICE_BASIC"),
            price_professional: amount("MERCADOPAGO_PRICE_PROFESSIONAL"),
            price_enterprise: amount("MERCADOPAGO_PRICE_ENTERPRISE"),
        })
    }
}

impl BillingConfig {
    #[must_use]
    pub fn checkout(&self) -> CheckoutConfig {
        CheckoutConfig::new(self.frontend_url.clone())
    }
}

/// Builder for Config with environment variable support
#[must_use = "builder does nothing until you call build()"]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.server.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.server.port = port;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn with_json_logging(mut self, enabled: bool) -> Self {
        self.config.logging.json = enabled;
        self
    }

    pub fn with_stripe(mut self, stripe: StripeConfig) -> Self {
        self.config.billing.stripe = Some(stripe);
        self
    }

    pub fn with_mercadopago(mut self, mercadopago: MercadoPagoConfig) -> Self {
        self.config.billing.mercadopago = Some(mercadopago);
        self
    }

    pub fn with_provider_timeout(mut self, seconds: u64) -> Self {
        self.config.billing.provider_timeout_seconds = seconds;
        self
    }

    pub fn with_frontend_url(mut self, url: impl Into<String>) -> Self {
        self.config.billing.frontend_url = url.into();
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn with_jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt_secret = Some(SecretString::from(secret.into()));
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = Some(url.into());
        self
    }

    /// Load configuration from environment variables with CLINIFY_ prefix
    pub fn from_env(mut self) -> Self {
        if let Some(host) = get_env_with_prefix("HOST") {
            self.config.server.host = host;
        }
        // CLINIFY_PORT first, then PORT as set by most hosting platforms
        if let Some(port) = get_env_with_prefix("PORT") {
            if let Ok(p) = port.parse() {
                self.config.server.port = p;
            }
        }
        if let Some(level) = get_env_with_prefix("LOG_LEVEL") {
            self.config.logging.level = level;
        }
        if let Some(json) = get_env_with_prefix("LOG_JSON") {
            self.config.logging.json = json.parse().unwrap_or(false);
        }

        self.config.billing.stripe = StripeConfig::from_env();
        self.config.billing.mercadopago = MercadoPagoConfig::from_env();
        if let Some(timeout) = get_env_with_prefix("PROVIDER_TIMEOUT_SECONDS") {
            if let Ok(t) = timeout.parse() {
                self.config.billing.provider_timeout_seconds = t;
            }
        }
        if let Some(url) = get_env_with_prefix("FRONTEND_URL") {
            self.config.billing.frontend_url = url;
        }

        if let Some(hours) = get_env_with_prefix("RETENTION_INTERVAL_HOURS") {
            if let Ok(h) = hours.parse() {
                self.config.retention.interval_hours = h;
            }
        }
        if let Some(days) = get_env_with_prefix("RETENTION_GRACE_DAYS") {
            if let Ok(d) = days.parse() {
                self.config.retention.grace_days = d;
            }
        }

        if let Some(secret) = get_env_with_prefix("JWT_SECRET") {
            self.config.jwt_secret = Some(SecretString::from(secret));
        }
        if let Some(url) = get_env_with_prefix("DATABASE_URL") {
            self.config.database_url = Some(url);
        }

        self
    }

    /// Build the configuration, validating all settings
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration is invalid:
    /// - Invalid server address (host:port)
    /// - Invalid log level
    /// - Zero provider timeout or retention interval
    /// - Negative grace period or provider price
    /// - Frontend URL that does not parse
    pub fn build(self) -> crate::error::Result<Config> {
        self.config.server.addr().map_err(|e| {
            crate::error::ClinifyError::bad_request(format!(
                "Invalid server address {}:{} - {}",
                self.config.server.host, self.config.server.port, e
            ))
        })?;

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.config.logging.level.to_lowercase().as_str()) {
            return Err(crate::error::ClinifyError::bad_request(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.config.logging.level,
                valid_log_levels.join(", ")
            )));
        }

        if self.config.server.port == 0 {
            return Err(crate::error::ClinifyError::bad_request(
                "Server port must be greater than 0",
            ));
        }

        if self.config.billing.provider_timeout_seconds == 0 {
            return Err(crate::error::ClinifyError::bad_request(
                "Provider timeout must be greater than 0",
            ));
        }

        if url::Url::parse(&self.config.billing.frontend_url).is_err() {
            return Err(crate::error::ClinifyError::bad_request(format!(
                "Invalid frontend URL: {}",
                self.config.billing.frontend_url
            )));
        }

        if let Some(mp) = &self.config.billing.mercadopago {
            let prices = [mp.price_basic, mp.price_professional, mp.price_enterprise];
            if prices.iter().flatten().any(|amount| *amount <= 0.0) {
                return Err(crate::error::ClinifyError::bad_request(
                    "MercadoPago prices must be greater than 0",
                ));
            }
        }

        if self.config.retention.interval_hours == 0 {
            return Err(crate::error::ClinifyError::bad_request(
                "Retention interval must be greater than 0",
            ));
        }

        if self.config.retention.grace_days < 0 {
            return Err(crate::error::ClinifyError::bad_request(
                "Retention grace period cannot be negative",
            ));
        }

        if let Some(secret) = &self.config.jwt_secret {
            if secret.expose_secret().len() < 32 {
                tracing::warn!(
                    target: "clinify::config",
                    "JWT secret is shorter than 32 bytes"
                );
            }
        }

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
