use crate::error::{ClinifyError, Result};
use jsonwebtoken::{Algorithm, DecodingKey, TokenData, Validation, decode};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// HS256 JWT verifier for tokens issued by the Clinify auth service
///
/// Only HS256 is accepted; tokens signed with any other algorithm, including
/// `none`, are rejected. Expiry is always validated.
pub struct JwtVerifier<C> {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    _claims: PhantomData<fn() -> C>,
}

impl<C> Clone for JwtVerifier<C> {
    fn clone(&self) -> Self {
        Self {
            decoding_key: self.decoding_key.clone(),
            validation: self.validation.clone(),
            _claims: PhantomData,
        }
    }
}

impl<C: DeserializeOwned> JwtVerifier<C> {
    /// Create a verifier using a static secret
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            validation,
            _claims: PhantomData,
        }
    }

    /// Set the expected issuer claim
    pub fn set_issuer(&mut self, issuer: impl Into<String>) {
        self.validation.set_issuer(&[issuer.into()]);
    }

    /// Verify and decode a JWT token
    pub fn verify(&self, token: &str) -> Result<TokenData<C>> {
        decode::<C>(token, &self.decoding_key, &self.validation)
            .map_err(|e| ClinifyError::unauthorized(format!("Invalid token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestClaims {
        sub: String,
        exp: usize,
    }

    const SECRET: &[u8] = b"my_secret_key_for_testing_12345";

    fn claims(exp_offset: chrono::Duration) -> TestClaims {
        TestClaims {
            sub: "tenant_123".to_string(),
            exp: (chrono::Utc::now() + exp_offset).timestamp() as usize,
        }
    }

    #[test]
    fn test_valid_token_is_accepted() {
        let verifier = JwtVerifier::<TestClaims>::from_secret(SECRET);
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims(chrono::Duration::hours(1)),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        assert_eq!(verifier.verify(&token).unwrap().claims.sub, "tenant_123");
    }

    #[test]
    fn test_algorithm_confusion_attack_rejected() {
        let verifier = JwtVerifier::<TestClaims>::from_secret(SECRET);
        let wrong_algo_token = encode(
            &Header::new(Algorithm::HS384),
            &claims(chrono::Duration::hours(1)),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();

        let err = verifier.verify(&wrong_algo_token).unwrap_err();
        assert!(err.to_string().contains("Invalid token"));
    }

    #[test]
    fn test_none_algorithm_rejected() {
        let verifier = JwtVerifier::<TestClaims>::from_secret(b"secret");

        // {"alg":"none","typ":"JWT"} . {"sub":"user123","exp":9999999999}
        let none_token = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.eyJzdWIiOiJ1c2VyMTIzIiwiZXhwIjo5OTk5OTk5OTk5fQ.";
        assert!(verifier.verify(none_token).is_err());
    }

    #[test]
    fn test_expired_and_wrong_secret_rejected() {
        let verifier = JwtVerifier::<TestClaims>::from_secret(SECRET);
        let expired = encode(
            &Header::new(Algorithm::HS256),
            &claims(chrono::Duration::hours(-2)),
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        assert!(verifier.verify(&expired).is_err());

        let foreign = encode(
            &Header::new(Algorithm::HS256),
            &claims(chrono::Duration::hours(1)),
            &EncodingKey::from_secret(b"another_secret_entirely_000000"),
        )
        .unwrap();
        assert!(verifier.verify(&foreign).is_err());
    }
}
