//! Shared webhook plumbing.
//!
//! Signature helpers and the processing outcome used by both provider
//! webhook handlers.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::error::{BillingError, BillingResult};

/// Maximum age of a signed webhook, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Outcome of webhook processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// Event was processed successfully.
    Processed,
    /// Event was ignored (not relevant, or an invalid transition).
    Ignored,
    /// Event was already processed (idempotency).
    AlreadyProcessed,
}

/// Compute a hex HMAC-SHA256.
pub(crate) fn compute_signature(secret: &str, payload: &[u8]) -> BillingResult<String> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::internal("HMAC error"))?;

    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check a provided hex signature against the expected one in constant time.
pub(crate) fn verify_signature(
    secret: &str,
    payload: &[u8],
    provided_hex: &str,
) -> BillingResult<()> {
    let expected = compute_signature(secret, payload)?;
    let expected_bytes =
        hex::decode(&expected).map_err(|_| BillingError::internal("Hex decode error"))?;
    let provided_bytes =
        hex::decode(provided_hex.trim()).map_err(|_| BillingError::InvalidWebhookSignature)?;

    if expected_bytes.ct_eq(&provided_bytes).unwrap_u8() != 1 {
        return Err(BillingError::InvalidWebhookSignature);
    }
    Ok(())
}

/// Reject timestamps outside the tolerance window.
pub(crate) fn check_timestamp(timestamp: i64, now: i64) -> BillingResult<()> {
    let age_seconds = (now - timestamp).abs();
    if age_seconds > SIGNATURE_TOLERANCE_SECS {
        return Err(BillingError::WebhookTimestampExpired { age_seconds });
    }
    Ok(())
}

/// Parse a `k=v,k=v` signature header into its `ts`/`t` and `v1` parts.
pub(crate) fn parse_signature_header(
    header: &str,
    timestamp_key: &str,
) -> BillingResult<(i64, String)> {
    let mut timestamp = None;
    let mut signature = None;

    for part in header.split(',') {
        let (key, value) = part
            .split_once('=')
            .ok_or(BillingError::InvalidWebhookSignature)?;

        match key.trim() {
            k if k == timestamp_key => timestamp = value.trim().parse().ok(),
            "v1" => signature = Some(value.trim().to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(ts), Some(sig)) => Ok((ts, sig)),
        _ => Err(BillingError::InvalidWebhookSignature),
    }
}

/// Parse a webhook body, logging the detail and returning a generic error.
pub(crate) fn parse_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> BillingResult<T> {
    serde_json::from_slice(payload).map_err(|e| {
        tracing::warn!(
            target: "clinify::billing::webhook",
            error = %e,
            "Failed to parse webhook payload"
        );
        BillingError::InvalidWebhookPayload {
            message: "malformed JSON payload".to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature_header() {
        let (ts, sig) = parse_signature_header("t=1234567890,v1=abc123def456", "t").unwrap();
        assert_eq!(ts, 1234567890);
        assert_eq!(sig, "abc123def456");

        let (ts, _) = parse_signature_header("ts=42, v1=ff", "ts").unwrap();
        assert_eq!(ts, 42);
    }

    #[test]
    fn test_parse_signature_header_invalid() {
        assert!(parse_signature_header("invalid", "t").is_err());
        assert!(parse_signature_header("t=1", "t").is_err());
        assert!(parse_signature_header("v1=abc", "t").is_err());
    }

    #[test]
    fn test_verify_signature() {
        let sig = compute_signature("secret", b"payload").unwrap();
        assert!(verify_signature("secret", b"payload", &sig).is_ok());
        assert_eq!(
            verify_signature("other", b"payload", &sig),
            Err(BillingError::InvalidWebhookSignature)
        );
        assert_eq!(
            verify_signature("secret", b"payload", "not-hex"),
            Err(BillingError::InvalidWebhookSignature)
        );
    }

    #[test]
    fn test_check_timestamp() {
        assert!(check_timestamp(1_000, 1_300).is_ok());
        assert_eq!(
            check_timestamp(1_000, 1_301),
            Err(BillingError::WebhookTimestampExpired { age_seconds: 301 })
        );
    }
}
