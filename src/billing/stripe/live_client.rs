//! Live Stripe client.
//!
//! Uses `async-stripe` with the secret key held in a `SecretString`. Every
//! call is bounded by a timeout and made exactly once.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::client::{
    CreateCheckoutSessionRequest, CreateCustomerRequest, StripeApi, StripeSubscriptionData,
};
use super::{META_PLAN, META_TENANT_ID};
use crate::billing::error::{BillingError, BillingResult};
use crate::billing::provider::CheckoutHandle;

const PROVIDER: &str = "stripe";

/// Configuration for the live Stripe client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStripeApiConfig {
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveStripeApiConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
        }
    }
}

impl LiveStripeApiConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Validate a Stripe secret or restricted key.
fn validate_api_key(key: &str) -> BillingResult<()> {
    const MIN_KEY_LENGTH: usize = 20;

    if key.len() < MIN_KEY_LENGTH {
        return Err(BillingError::validation(format!(
            "Stripe API key too short (minimum {} characters)",
            MIN_KEY_LENGTH
        )));
    }

    let valid_prefixes = ["sk_test_", "sk_live_", "rk_test_", "rk_live_"];
    if !valid_prefixes.iter().any(|prefix| key.starts_with(prefix)) {
        return Err(BillingError::validation(
            "Stripe API key must start with sk_test_, sk_live_, rk_test_, or rk_live_",
        ));
    }

    Ok(())
}

fn parse_customer_id(id: &str) -> BillingResult<::stripe::CustomerId> {
    id.parse()
        .map_err(|_| BillingError::validation(format!("Invalid customer ID: {}", id)))
}

fn parse_subscription_id(id: &str) -> BillingResult<::stripe::SubscriptionId> {
    id.parse()
        .map_err(|_| BillingError::validation(format!("Invalid subscription ID: {}", id)))
}

/// [`StripeApi`] backed by the Stripe REST API.
pub struct LiveStripeApi {
    client: ::stripe::Client,
    config: LiveStripeApiConfig,
    api_key: SecretString,
}

impl LiveStripeApi {
    /// Create a live client.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the key format is invalid.
    pub fn new(api_key: SecretString, config: LiveStripeApiConfig) -> BillingResult<Self> {
        validate_api_key(api_key.expose_secret())?;

        let client = ::stripe::Client::new(api_key.expose_secret()).with_app_info(
            env!("CARGO_PKG_NAME").to_string(),
            Some(env!("CARGO_PKG_VERSION").to_string()),
            None,
        );

        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        let key = self.api_key.expose_secret();
        key.starts_with("sk_test_") || key.starts_with("rk_test_")
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_seconds)
    }

    fn generate_idempotency_key(operation: &str) -> String {
        format!("{}_{}", operation, uuid::Uuid::new_v4())
    }

    /// Client carrying an idempotency key, for mutating calls.
    fn idempotent_client(&self, operation: &str) -> ::stripe::Client {
        let key = Self::generate_idempotency_key(operation);
        self.client
            .clone()
            .with_strategy(::stripe::RequestStrategy::Idempotent(key))
    }

    /// Run one Stripe call under the configured timeout.
    async fn call<T, Fut>(&self, operation: &str, fut: Fut) -> BillingResult<T>
    where
        Fut: std::future::Future<Output = Result<T, ::stripe::StripeError>>,
    {
        match tokio::time::timeout(self.timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_stripe_error(e, operation)),
            Err(_) => {
                tracing::warn!(
                    target: "clinify::billing::stripe",
                    operation = operation,
                    timeout_seconds = self.config.timeout_seconds,
                    "Stripe API request timed out"
                );
                Err(BillingError::upstream(
                    PROVIDER,
                    operation,
                    format!(
                        "Request timed out after {} seconds",
                        self.config.timeout_seconds
                    ),
                    Some(408),
                ))
            }
        }
    }
}

impl std::fmt::Debug for LiveStripeApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStripeApi")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn map_stripe_error(error: ::stripe::StripeError, operation: &str) -> BillingError {
    match error {
        ::stripe::StripeError::Stripe(request_error) => {
            let message = request_error
                .message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            BillingError::upstream(
                PROVIDER,
                operation,
                message,
                Some(request_error.http_status),
            )
        }
        ::stripe::StripeError::Timeout => {
            BillingError::upstream(PROVIDER, operation, "Request timed out", Some(408))
        }
        ::stripe::StripeError::ClientError(msg) => {
            BillingError::upstream(PROVIDER, operation, format!("HTTP client error: {msg}"), None)
        }
        other => BillingError::internal(format!("Stripe {operation} failed: {other}")),
    }
}

fn tenant_metadata(tenant_id: &str, plan: Option<&str>) -> HashMap<String, String> {
    let mut meta = HashMap::new();
    meta.insert(META_TENANT_ID.to_string(), tenant_id.to_string());
    if let Some(plan) = plan {
        meta.insert(META_PLAN.to_string(), plan.to_string());
    }
    meta
}

fn status_str(status: ::stripe::SubscriptionStatus) -> &'static str {
    match status {
        ::stripe::SubscriptionStatus::Active => "active",
        ::stripe::SubscriptionStatus::Canceled => "canceled",
        ::stripe::SubscriptionStatus::Incomplete => "incomplete",
        ::stripe::SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        ::stripe::SubscriptionStatus::PastDue => "past_due",
        ::stripe::SubscriptionStatus::Trialing => "trialing",
        ::stripe::SubscriptionStatus::Unpaid => "unpaid",
        ::stripe::SubscriptionStatus::Paused => "paused",
    }
}

fn map_subscription(sub: ::stripe::Subscription) -> StripeSubscriptionData {
    let customer_id = match &sub.customer {
        ::stripe::Expandable::Id(id) => id.to_string(),
        ::stripe::Expandable::Object(c) => c.id.to_string(),
    };
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    StripeSubscriptionData {
        id: sub.id.to_string(),
        customer_id,
        status: status_str(sub.status).to_string(),
        current_period_end: sub.current_period_end,
        cancel_at_period_end: sub.cancel_at_period_end,
        metadata: sub.metadata,
        price_id,
    }
}

#[async_trait]
impl StripeApi for LiveStripeApi {
    async fn create_customer(&self, request: CreateCustomerRequest) -> BillingResult<String> {
        let client = self.idempotent_client("create_customer");

        let mut params = ::stripe::CreateCustomer::new();
        params.email = Some(&request.email);
        params.name = request.name.as_deref();
        params.metadata = Some(tenant_metadata(&request.tenant_id, None));

        let customer = self
            .call(
                "create_customer",
                ::stripe::Customer::create(&client, params),
            )
            .await?;

        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: CreateCheckoutSessionRequest,
    ) -> BillingResult<CheckoutHandle> {
        let client = self.idempotent_client("create_checkout_session");
        let customer_id = parse_customer_id(&request.customer_id)?;
        let metadata = tenant_metadata(&request.tenant_id, Some(request.plan.as_str()));

        let mut params = ::stripe::CreateCheckoutSession::new();
        params.customer = Some(customer_id);
        params.mode = Some(::stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.client_reference_id = Some(&request.tenant_id);
        params.line_items = Some(vec![::stripe::CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.subscription_data = Some(::stripe::CreateCheckoutSessionSubscriptionData {
            metadata: Some(metadata.clone()),
            ..Default::default()
        });
        params.metadata = Some(metadata);

        let session = self
            .call(
                "create_checkout_session",
                ::stripe::CheckoutSession::create(&client, params),
            )
            .await?;

        let session_url = session
            .url
            .ok_or_else(|| BillingError::internal("Checkout session URL missing"))?;

        Ok(CheckoutHandle {
            session_id: session.id.to_string(),
            session_url,
        })
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<StripeSubscriptionData>> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = ::stripe::ListSubscriptions::new();
        params.customer = Some(customer_id);

        let list = self
            .call(
                "list_subscriptions",
                ::stripe::Subscription::list(&self.client, &params),
            )
            .await?;

        Ok(list.data.into_iter().map(map_subscription).collect())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_id)?;

        self.call(
            "cancel_subscription",
            ::stripe::Subscription::cancel(
                &self.client,
                &sub_id,
                ::stripe::CancelSubscription::default(),
            ),
        )
        .await?;

        Ok(())
    }

    async fn cancel_subscription_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        let client = self.idempotent_client("cancel_subscription_at_period_end");
        let sub_id = parse_subscription_id(subscription_id)?;

        let mut params = ::stripe::UpdateSubscription::new();
        params.cancel_at_period_end = Some(true);

        self.call(
            "cancel_subscription_at_period_end",
            ::stripe::Subscription::update(&client, &sub_id, params),
        )
        .await?;

        Ok(())
    }
}
