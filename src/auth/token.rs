use crate::error::ClinifyError;
use axum::http::request::Parts;

/// Extracts bearer token from request headers
pub struct TokenExtractor;

impl TokenExtractor {
    /// Extract token from Authorization header
    pub fn from_header(parts: &Parts) -> Result<String, ClinifyError> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ClinifyError::unauthorized("Missing authorization header"))?;

        let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
            ClinifyError::unauthorized(
                "Invalid authorization header format. Expected: Bearer <token>",
            )
        })?;

        let token = token.trim();
        if token.is_empty() {
            return Err(ClinifyError::unauthorized("Empty bearer token"));
        }

        Ok(token.to_string())
    }
}
