//! Provider webhook endpoints under `/api/webhooks`.
//!
//! Bodies are taken as raw bytes so signatures are checked against exactly
//! what the provider sent.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Serialize;

use crate::app::AppState;
use crate::billing::{BillingError, ProviderKind, WebhookOutcome};
use crate::error::{ClinifyError, Result};
use crate::http::RouteModule;

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub outcome: WebhookOutcome,
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ClinifyError::bad_request(format!("Missing {} header", name)))
}

fn not_configured(provider: ProviderKind) -> ClinifyError {
    BillingError::ProviderNotConfigured {
        provider: provider.to_string(),
    }
    .into()
}

fn log_rejection(provider: ProviderKind, err: &BillingError) {
    if err.is_client_error() {
        tracing::warn!(
            target: "clinify::billing::webhook",
            provider = %provider,
            error = %err,
            "Webhook rejected"
        );
    }
}

async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let handler = state
        .stripe_webhooks
        .as_ref()
        .ok_or_else(|| not_configured(ProviderKind::Stripe))?;
    let signature = required_header(&headers, "stripe-signature")?;

    let outcome = handler.process(&body, signature).await.inspect_err(|e| {
        log_rejection(ProviderKind::Stripe, e);
    })?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

async fn mercadopago_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>> {
    let handler = state
        .mercadopago_webhooks
        .as_ref()
        .ok_or_else(|| not_configured(ProviderKind::MercadoPago))?;
    let signature = required_header(&headers, "x-signature")?;
    let request_id = required_header(&headers, "x-request-id")?;

    let outcome = handler
        .process(&body, signature, request_id)
        .await
        .inspect_err(|e| log_rejection(ProviderKind::MercadoPago, e))?;

    Ok(Json(WebhookAck {
        received: true,
        outcome,
    }))
}

/// Stripe and MercadoPago webhook receivers.
pub struct WebhookModule;

impl RouteModule for WebhookModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/stripe", post(stripe_webhook))
            .route("/mercadopago", post(mercadopago_webhook))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/api/webhooks")
    }
}
