//! Live MercadoPago client over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::client::{CURRENCY_ID, CreatePreapprovalRequest, MercadoPagoApi, Preapproval};
use crate::billing::error::{BillingError, BillingResult};

const PROVIDER: &str = "mercadopago";
const DEFAULT_BASE_URL: &str = "https://api.mercadopago.com";

/// Configuration for the live MercadoPago client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMercadoPagoApiConfig {
    pub base_url: String,
    /// Request timeout in seconds.
    pub timeout_seconds: u64,
}

impl Default for LiveMercadoPagoApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_seconds: 10,
        }
    }
}

impl LiveMercadoPagoApiConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

#[derive(Debug, Deserialize)]
struct SearchResults<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct Customer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
    error: Option<String>,
}

/// [`MercadoPagoApi`] backed by the MercadoPago REST API.
pub struct LiveMercadoPagoApi {
    client: reqwest::Client,
    config: LiveMercadoPagoApiConfig,
    access_token: SecretString,
}

impl LiveMercadoPagoApi {
    /// Create a live client.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or the HTTP client cannot be built.
    pub fn new(
        access_token: SecretString,
        config: LiveMercadoPagoApiConfig,
    ) -> BillingResult<Self> {
        if access_token.expose_secret().trim().is_empty() {
            return Err(BillingError::validation(
                "MercadoPago access token cannot be empty",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BillingError::internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            access_token,
        })
    }

    #[must_use]
    pub fn is_test_mode(&self) -> bool {
        self.access_token.expose_secret().starts_with("TEST-")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Send one request and decode a JSON response.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> BillingResult<T> {
        let response = request
            .bearer_auth(self.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, operation, self.config.timeout_seconds))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.json::<ApiErrorBody>().await.ok();
            return Err(map_status_error(status, body, operation));
        }

        response.json::<T>().await.map_err(|e| {
            BillingError::upstream(
                PROVIDER,
                operation,
                format!("Invalid response body: {e}"),
                Some(status.as_u16()),
            )
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }
}

impl std::fmt::Debug for LiveMercadoPagoApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveMercadoPagoApi")
            .field("config", &self.config)
            .field("is_test_mode", &self.is_test_mode())
            .finish_non_exhaustive()
    }
}

fn map_reqwest_error(error: reqwest::Error, operation: &str, timeout_seconds: u64) -> BillingError {
    if error.is_timeout() {
        tracing::warn!(
            target: "clinify::billing::mercadopago",
            operation = operation,
            timeout_seconds = timeout_seconds,
            "MercadoPago API request timed out"
        );
        return BillingError::upstream(
            PROVIDER,
            operation,
            format!("Request timed out after {} seconds", timeout_seconds),
            Some(408),
        );
    }
    BillingError::upstream(
        PROVIDER,
        operation,
        format!("HTTP client error: {error}"),
        error.status().map(|s| s.as_u16()),
    )
}

fn map_status_error(status: StatusCode, body: Option<ApiErrorBody>, operation: &str) -> BillingError {
    let message = body
        .and_then(|b| b.message.or(b.error))
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
    BillingError::upstream(PROVIDER, operation, message, Some(status.as_u16()))
}

#[async_trait]
impl MercadoPagoApi for LiveMercadoPagoApi {
    async fn search_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        let found: SearchResults<Customer> = self
            .send(
                "search_customer",
                self.request(Method::GET, "/v1/customers/search")
                    .query(&[("email", email)]),
            )
            .await?;
        Ok(found.results.into_iter().next().map(|c| c.id))
    }

    async fn create_customer(&self, email: &str, name: Option<&str>) -> BillingResult<String> {
        let mut body = json!({ "email": email });
        if let Some(name) = name {
            body["first_name"] = json!(name);
        }

        let customer: Customer = self
            .send(
                "create_customer",
                self.request(Method::POST, "/v1/customers").json(&body),
            )
            .await?;
        Ok(customer.id)
    }

    async fn create_preapproval(
        &self,
        request: CreatePreapprovalRequest,
    ) -> BillingResult<Preapproval> {
        let body = json!({
            "reason": request.reason,
            "external_reference": request.external_reference,
            "payer_email": request.payer_email,
            "back_url": request.back_url,
            "status": "pending",
            "auto_recurring": {
                "frequency": 1,
                "frequency_type": "months",
                "transaction_amount": request.transaction_amount,
                "currency_id": CURRENCY_ID,
            },
        });

        self.send(
            "create_preapproval",
            self.request(Method::POST, "/preapproval").json(&body),
        )
        .await
    }

    async fn search_preapprovals(
        &self,
        external_reference: &str,
    ) -> BillingResult<Vec<Preapproval>> {
        let found: SearchResults<Preapproval> = self
            .send(
                "search_preapprovals",
                self.request(Method::GET, "/preapproval/search")
                    .query(&[("external_reference", external_reference)]),
            )
            .await?;
        Ok(found.results)
    }

    async fn get_preapproval(&self, preapproval_id: &str) -> BillingResult<Preapproval> {
        self.send(
            "get_preapproval",
            self.request(Method::GET, &format!("/preapproval/{}", preapproval_id)),
        )
        .await
    }

    async fn cancel_preapproval(&self, preapproval_id: &str) -> BillingResult<()> {
        let _: serde_json::Value = self
            .send(
                "cancel_preapproval",
                self.request(Method::PUT, &format!("/preapproval/{}", preapproval_id))
                    .json(&json!({ "status": "cancelled" })),
            )
            .await?;
        Ok(())
    }

    async fn end_preapproval_at(
        &self,
        preapproval_id: &str,
        end_date: DateTime<Utc>,
    ) -> BillingResult<()> {
        let _: serde_json::Value = self
            .send(
                "end_preapproval_at",
                self.request(Method::PUT, &format!("/preapproval/{}", preapproval_id))
                    .json(&json!({ "auto_recurring": { "end_date": end_date.to_rfc3339() } })),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[test]
    fn test_rejects_empty_token() {
        assert!(LiveMercadoPagoApi::new(token("  "), LiveMercadoPagoApiConfig::new()).is_err());
    }

    #[test]
    fn test_debug_does_not_expose_token() {
        let client =
            LiveMercadoPagoApi::new(token("TEST-123-secret"), LiveMercadoPagoApiConfig::new())
                .unwrap();
        let debug_output = format!("{:?}", client);
        assert!(!debug_output.contains("TEST-123-secret"));
        assert!(debug_output.contains("is_test_mode: true"));
    }

    #[test]
    fn test_config_builder() {
        let config = LiveMercadoPagoApiConfig::new()
            .base_url("http://localhost:9999/")
            .timeout_seconds(3);
        assert_eq!(config.base_url, "http://localhost:9999");
        assert_eq!(config.timeout_seconds, 3);
        assert_eq!(LiveMercadoPagoApiConfig::default().timeout_seconds, 10);
    }

    #[test]
    fn test_status_error_keeps_message() {
        let err = map_status_error(
            StatusCode::BAD_REQUEST,
            Some(ApiErrorBody {
                message: Some("payer_email invalid".to_string()),
                error: None,
            }),
            "create_preapproval",
        );
        assert_eq!(
            err,
            BillingError::upstream(PROVIDER, "create_preapproval", "payer_email invalid", Some(400))
        );

        let err = map_status_error(StatusCode::BAD_GATEWAY, None, "get_preapproval");
        assert!(err.is_server_error());
    }

    #[test]
    fn test_preapproval_deserializes_api_shape() {
        let preapproval: Preapproval = serde_json::from_value(json!({
            "id": "2c938084726fca480172750000000000",
            "status": "authorized",
            "external_reference": "tenant_1",
            "payer_id": 123456,
            "init_point": "https://www.mercadopago.com.br/subscriptions/checkout?preapproval_id=1",
            "next_payment_date": "2024-02-10T10:00:00.000-03:00",
            "auto_recurring": {
                "frequency": 1,
                "frequency_type": "months",
                "transaction_amount": 99.9,
                "currency_id": "BRL"
            }
        }))
        .unwrap();

        assert_eq!(preapproval.amount(), Some(99.9));
        assert_eq!(
            preapproval.next_payment_date,
            "2024-02-10T13:00:00Z".parse::<DateTime<Utc>>().ok()
        );
    }
}
