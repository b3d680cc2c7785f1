use crate::auth::{jwt::JwtVerifier, token::TokenExtractor};
use crate::billing::Billable;
use crate::error::ClinifyError;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Claims carried by Clinify access tokens. `sub` is the tenant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantClaims {
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exp: usize,
}

/// Verifier shared through application state.
pub type TenantVerifier = Arc<JwtVerifier<TenantClaims>>;

/// Axum extractor for the authenticated tenant
///
/// Rejects the request with 401 when the bearer token is missing or invalid.
///
/// # Example
///
/// ```rust,ignore
/// async fn handler(tenant: AuthTenant) -> String {
///     format!("Tenant: {}", tenant.id)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AuthTenant {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
}

impl From<TenantClaims> for AuthTenant {
    fn from(claims: TenantClaims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            name: claims.name,
        }
    }
}

impl Billable for AuthTenant {
    fn tenant_id(&self) -> &str {
        &self.id
    }

    fn email(&self) -> &str {
        &self.email
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl<S> FromRequestParts<S> for AuthTenant
where
    TenantVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ClinifyError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = TenantVerifier::from_ref(state);
        let token = TokenExtractor::from_header(parts)?;
        let claims = verifier.verify(&token)?.claims;

        if claims.sub.trim().is_empty() {
            return Err(ClinifyError::unauthorized("Token has no tenant"));
        }

        Ok(claims.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use jsonwebtoken::{EncodingKey, Header, encode};

    const SECRET: &[u8] = b"extractor_test_secret_0123456789";

    #[derive(Clone)]
    struct TestState {
        verifier: TenantVerifier,
    }

    impl FromRef<TestState> for TenantVerifier {
        fn from_ref(state: &TestState) -> Self {
            state.verifier.clone()
        }
    }

    fn state() -> TestState {
        TestState {
            verifier: Arc::new(JwtVerifier::from_secret(SECRET)),
        }
    }

    fn token(sub: &str) -> String {
        let claims = TenantClaims {
            sub: sub.to_string(),
            email: "clinic@example.com".to_string(),
            name: Some("Clinica Sorriso".to_string()),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap()
    }

    fn parts(auth: &str) -> Parts {
        Request::builder()
            .header("authorization", auth)
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    #[tokio::test]
    async fn test_extracts_tenant_from_claims() {
        let mut parts = parts(&format!("Bearer {}", token("tenant_1")));
        let tenant = AuthTenant::from_request_parts(&mut parts, &state())
            .await
            .unwrap();

        assert_eq!(tenant.tenant_id(), "tenant_1");
        assert_eq!(tenant.email(), "clinic@example.com");
        assert_eq!(tenant.name(), Some("Clinica Sorriso"));
    }

    #[tokio::test]
    async fn test_rejects_bad_token_and_empty_tenant() {
        let mut bad = parts("Bearer not-a-jwt");
        let err = AuthTenant::from_request_parts(&mut bad, &state())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::UNAUTHORIZED);

        let mut empty = parts(&format!("Bearer {}", token(" ")));
        assert!(
            AuthTenant::from_request_parts(&mut empty, &state())
                .await
                .is_err()
        );
    }
}
