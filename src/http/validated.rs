use crate::error::ClinifyError;
use axum::{Json, extract::Request};
use serde::Deserialize;
use validator::Validate;

/// Wrapper for validated JSON data
///
/// Rejects the request with 400 when the body is not valid JSON for `T` or
/// when `T::validate` fails.
///
/// # Example
///
/// ```rust,ignore
/// async fn checkout(
///     ValidatedJson(req): ValidatedJson<CheckoutRequest>
/// ) -> Result<Json<CheckoutResponse>> {
///     // req is guaranteed to be valid
/// }
/// ```
pub struct ValidatedJson<T>(pub T);

impl<T, S> axum::extract::FromRequest<S> for ValidatedJson<T>
where
    T: for<'de> Deserialize<'de> + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ClinifyError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let json: Json<T> = Json::from_request(req, state)
            .await
            .map_err(|e| ClinifyError::bad_request(format!("Invalid JSON: {}", e.body_text())))?;

        json.0.validate()?;

        Ok(ValidatedJson(json.0))
    }
}
