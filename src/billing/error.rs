//! Billing-specific error types.
//!
//! Provider adapters, the subscription manager and the entitlement evaluator
//! return [`BillingError`]; HTTP handlers convert it into [`ClinifyError`].

use std::fmt;

use crate::error::ClinifyError;

/// Result alias for billing operations.
pub type BillingResult<T> = std::result::Result<T, BillingError>;

/// Billing-specific errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingError {
    /// The provider's credentials are not configured.
    ProviderNotConfigured { provider: String },
    /// The plan has no price configured for the provider.
    PlanNotAvailable { plan: String, provider: String },
    /// Cancellation was requested but the tenant has nothing to cancel.
    NoActiveSubscription { tenant_id: String },
    /// Creation blocked by a plan quota.
    ResourceQuotaExceeded {
        resource: String,
        current: i64,
        limit: i64,
    },
    /// Malformed input.
    Validation { message: String },
    /// Unknown tenant or subscription.
    NotFound { what: String },
    /// A provider API call failed.
    UpstreamProviderError {
        provider: String,
        operation: String,
        message: String,
        http_status: Option<u16>,
    },

    // Webhook errors
    /// Webhook signature is invalid.
    InvalidWebhookSignature,
    /// Webhook timestamp is too old.
    WebhookTimestampExpired { age_seconds: i64 },
    /// Webhook event data is malformed.
    InvalidWebhookPayload { message: String },

    /// A status change that the lifecycle does not allow.
    InvalidTransition { from: String, to: String },
    /// An unexpected internal error occurred.
    Internal { message: String },
}

impl BillingError {
    pub fn upstream(
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
        http_status: Option<u16>,
    ) -> Self {
        Self::UpstreamProviderError {
            provider: provider.into(),
            operation: operation.into(),
            message: message.into(),
            http_status,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a client error (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Internal { .. } | Self::InvalidTransition { .. } => false,
            Self::UpstreamProviderError { http_status, .. } => {
                matches!(http_status, Some(400..=499))
            }
            _ => true,
        }
    }

    /// Check if this is a server error (5xx).
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderNotConfigured { provider } => {
                write!(f, "Billing provider '{}' is not configured", provider)
            }
            Self::PlanNotAvailable { plan, provider } => {
                write!(f, "Plan '{}' is not available with {}", plan, provider)
            }
            Self::NoActiveSubscription { tenant_id } => {
                write!(f, "No active subscription for tenant '{}'", tenant_id)
            }
            Self::ResourceQuotaExceeded {
                resource,
                current,
                limit,
            } => {
                write!(f, "Limit reached for {}: {}/{}", resource, current, limit)
            }
            Self::Validation { message } => write!(f, "Validation failed: {}", message),
            Self::NotFound { what } => write!(f, "{} not found", what),
            Self::UpstreamProviderError {
                provider,
                operation,
                message,
                http_status,
            } => {
                write!(f, "{} error during '{}': {}", provider, operation, message)?;
                if let Some(status) = http_status {
                    write!(f, " [HTTP {}]", status)?;
                }
                Ok(())
            }
            Self::InvalidWebhookSignature => write!(f, "Invalid webhook signature"),
            Self::WebhookTimestampExpired { age_seconds } => {
                write!(f, "Webhook timestamp expired ({} seconds old)", age_seconds)
            }
            Self::InvalidWebhookPayload { message } => {
                write!(f, "Invalid webhook payload: {}", message)
            }
            Self::InvalidTransition { from, to } => {
                write!(f, "Invalid subscription transition {} -> {}", from, to)
            }
            Self::Internal { message } => write!(f, "Internal billing error: {}", message),
        }
    }
}

impl std::error::Error for BillingError {}

impl From<BillingError> for ClinifyError {
    fn from(err: BillingError) -> Self {
        match &err {
            BillingError::ResourceQuotaExceeded {
                resource,
                current,
                limit,
            } => ClinifyError::QuotaExceeded {
                resource: resource.clone(),
                current: *current,
                limit: *limit,
            },

            BillingError::NotFound { .. } => ClinifyError::NotFound(err.to_string()),

            BillingError::PlanNotAvailable { .. }
            | BillingError::NoActiveSubscription { .. }
            | BillingError::Validation { .. }
            | BillingError::InvalidWebhookSignature
            | BillingError::WebhookTimestampExpired { .. }
            | BillingError::InvalidWebhookPayload { .. }
            | BillingError::ProviderNotConfigured { .. } => {
                ClinifyError::BadRequest(err.to_string())
            }

            // Provider 4xx messages are safe to pass through ("No such price").
            BillingError::UpstreamProviderError {
                message,
                http_status: Some(400..=499),
                ..
            } => ClinifyError::BadRequest(message.clone()),
            BillingError::UpstreamProviderError { .. } => {
                ClinifyError::ServiceUnavailable(err.to_string())
            }

            BillingError::InvalidTransition { .. } | BillingError::Internal { .. } => {
                ClinifyError::Internal(err.to_string())
            }
        }
    }
}

/// Store failures surfacing inside billing operations.
impl From<ClinifyError> for BillingError {
    fn from(err: ClinifyError) -> Self {
        match err {
            ClinifyError::NotFound(what) => BillingError::NotFound { what },
            ClinifyError::BadRequest(message) => BillingError::Validation { message },
            other => BillingError::Internal {
                message: other.to_string(),
            },
        }
    }
}
