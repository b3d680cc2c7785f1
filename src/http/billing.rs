//! Authenticated billing endpoints under `/api/billing`.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::app::AppState;
use crate::auth::AuthTenant;
use crate::billing::{
    CheckoutHandle, Entitlements, PlanId, ProviderKind, QuotaCheck, ResourceKind,
    StoredSubscription,
};
use crate::error::{ClinifyError, Result};
use crate::http::{RouteModule, ValidatedJson};

/// Body of `POST /api/billing/checkout`.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(length(min = 1, message = "plan is required"))]
    pub plan: String,
    pub provider: Option<ProviderKind>,
    #[validate(url(message = "must be a valid URL"))]
    pub success_url: Option<String>,
    #[validate(url(message = "must be a valid URL"))]
    pub cancel_url: Option<String>,
}

/// Body of `POST /api/billing/cancel`.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub at_period_end: Option<bool>,
    pub provider: Option<ProviderKind>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub subscription: StoredSubscription,
}

async fn create_checkout(
    State(state): State<AppState>,
    tenant: AuthTenant,
    ValidatedJson(req): ValidatedJson<CheckoutRequest>,
) -> Result<Json<CheckoutHandle>> {
    let plan: PlanId = req.plan.parse().map_err(ClinifyError::bad_request)?;
    let provider = state.providers.resolve(req.provider)?;
    let urls = state
        .checkout
        .resolve_urls(req.success_url.as_deref(), req.cancel_url.as_deref())?;

    let handle = provider.start_checkout(&tenant, plan, &urls).await?;

    tracing::info!(
        target: "clinify::billing",
        tenant_id = %tenant.id,
        plan = %plan,
        provider = %provider.kind(),
        session_id = %handle.session_id,
        "Checkout started"
    );

    Ok(Json(handle))
}

async fn cancel_subscription(
    State(state): State<AppState>,
    tenant: AuthTenant,
    ValidatedJson(req): ValidatedJson<CancelRequest>,
) -> Result<Json<CancelResponse>> {
    // Without an explicit provider, cancel with whichever provider drives the record.
    let kind = match req.provider {
        Some(kind) => Some(kind),
        None => state
            .subscriptions
            .get(&tenant.id)
            .await?
            .and_then(|sub| sub.provider),
    };
    let provider = state.providers.resolve(kind)?;
    let at_period_end = req.at_period_end.unwrap_or(false);

    let subscription = provider.cancel(&tenant, at_period_end).await?;

    tracing::info!(
        target: "clinify::billing",
        tenant_id = %tenant.id,
        provider = %provider.kind(),
        at_period_end,
        "Subscription canceled"
    );

    Ok(Json(CancelResponse {
        success: true,
        subscription,
    }))
}

async fn get_subscription(State(state): State<AppState>, tenant: AuthTenant) -> Json<Entitlements> {
    Json(state.entitlements.get_entitlements(&tenant.id).await)
}

async fn get_quota(
    State(state): State<AppState>,
    tenant: AuthTenant,
    Path(resource): Path<String>,
) -> Result<Json<QuotaCheck>> {
    let kind: ResourceKind = resource.parse().map_err(ClinifyError::bad_request)?;
    Ok(Json(state.entitlements.can_create(&tenant.id, kind).await))
}

/// Checkout, cancellation and entitlement lookups for the calling tenant.
pub struct BillingModule;

impl RouteModule for BillingModule {
    fn routes(&self) -> Router<AppState> {
        Router::new()
            .route("/checkout", post(create_checkout))
            .route("/cancel", post(cancel_subscription))
            .route("/subscription", get(get_subscription))
            .route("/quota/{resource}", get(get_quota))
    }

    fn prefix(&self) -> Option<&str> {
        Some("/api/billing")
    }
}
