//! Checkout redirect handling.
//!
//! Resolves the success and cancel URLs for a checkout, falling back to the
//! frontend's billing page and rejecting open redirects.

use url::Url;

use super::error::{BillingError, BillingResult};
use super::provider::CheckoutUrls;

/// Checkout redirect configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutConfig {
    /// Base URL of the frontend (e.g. `https://app.clinify.com.br`).
    pub frontend_url: String,
    /// Allowed domains for redirect URLs. Empty allows only the frontend host.
    pub allowed_redirect_domains: Vec<String>,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            frontend_url: "http://localhost:5173".to_string(),
            allowed_redirect_domains: Vec::new(),
        }
    }
}

impl CheckoutConfig {
    #[must_use]
    pub fn new(frontend_url: impl Into<String>) -> Self {
        Self {
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
            allowed_redirect_domains: Vec::new(),
        }
    }

    /// Add an allowed redirect domain. Subdomains are allowed too.
    #[must_use]
    pub fn allow_domain(mut self, domain: impl Into<String>) -> Self {
        self.allowed_redirect_domains.push(domain.into());
        self
    }

    #[must_use]
    pub fn default_success_url(&self) -> String {
        format!("{}/settings/billing?success=true", self.frontend_url)
    }

    #[must_use]
    pub fn default_cancel_url(&self) -> String {
        format!("{}/settings/billing?canceled=true", self.frontend_url)
    }

    /// Resolve the redirect URLs for a checkout request.
    pub fn resolve_urls(
        &self,
        success_url: Option<&str>,
        cancel_url: Option<&str>,
    ) -> BillingResult<CheckoutUrls> {
        let success_url = match success_url {
            Some(url) => url.to_string(),
            None => self.default_success_url(),
        };
        let cancel_url = match cancel_url {
            Some(url) => url.to_string(),
            None => self.default_cancel_url(),
        };

        self.validate_redirect_url(&success_url)?;
        self.validate_redirect_url(&cancel_url)?;

        Ok(CheckoutUrls {
            success_url,
            cancel_url,
        })
    }

    /// Validate a redirect URL.
    ///
    /// The URL must use HTTPS (plain HTTP is accepted for localhost) and its
    /// host must be the frontend host or an allowed domain.
    pub fn validate_redirect_url(&self, url: &str) -> BillingResult<()> {
        let parsed = Url::parse(url)
            .map_err(|e| BillingError::validation(format!("Invalid redirect URL: {}", e)))?;

        let host = parsed
            .host_str()
            .ok_or_else(|| BillingError::validation("Redirect URL must have a host"))?;

        let is_local = host == "localhost" || host == "127.0.0.1";
        match parsed.scheme() {
            "https" => {}
            "http" if is_local => {}
            _ => return Err(BillingError::validation("Redirect URL must use HTTPS")),
        }

        let frontend_host = Url::parse(&self.frontend_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        let domain_allowed = frontend_host.as_deref() == Some(host)
            || self
                .allowed_redirect_domains
                .iter()
                .any(|allowed| host == allowed || host.ends_with(&format!(".{}", allowed)));

        if !domain_allowed {
            return Err(BillingError::validation(format!(
                "Redirect URL domain '{}' is not allowed",
                host
            )));
        }

        Ok(())
    }
}
