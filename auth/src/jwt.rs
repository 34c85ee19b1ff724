// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;
use biscuit::jwa::SignatureAlgorithm;
use biscuit::{ClaimPresenceOptions, TemporalOptions, Validation, ValidationOptions};
use biscuit::errors::ValidationError;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;

use crate::jwks::KeySetProvider;
use crate::{
    get_bearer_token, AuthError, AuthenticationMetadata, Authenticator, MetadataExtractor,
    RequestContext,
};

pub type ClaimsSet = biscuit::ClaimsSet<Value>;
pub type JWT = biscuit::JWT<Value, biscuit::Empty>;

/// How the token's signature is checked.
pub enum SignatureVerifier {
    /// An inline symmetric secret (HS256/HS384/HS512).
    HmacSecret {
        secret: Vec<u8>,
        algorithm: SignatureAlgorithm,
    },
    /// A static DER-encoded public key (RS*/ES*).
    StaticPublicKey {
        der: Vec<u8>,
        algorithm: SignatureAlgorithm,
    },
    /// A JSON Web Key Set, typically refreshed from the issuer.
    JwkSet(Arc<dyn KeySetProvider>),
}

impl SignatureVerifier {
    fn decode(&self, token: &str) -> Result<ClaimsSet, AuthError> {
        let jwt = JWT::new_encoded(token);
        let decoded = match self {
            SignatureVerifier::HmacSecret { secret, algorithm } => jwt
                .into_decoded(&biscuit::jws::Secret::Bytes(secret.clone()), *algorithm),
            SignatureVerifier::StaticPublicKey { der, algorithm } => {
                jwt.into_decoded(&biscuit::jws::Secret::PublicKey(der.clone()), *algorithm)
            }
            SignatureVerifier::JwkSet(provider) => {
                let key_set = provider.key_set().ok_or_else(|| {
                    AuthError::Internal("No usable JSON Web Key Set is available".to_owned())
                })?;
                jwt.decode_with_jwks(&key_set, None)
            }
        }
        .map_err(|err| {
            log::error!("auth_failure: token could not be decoded: {err}");
            AuthError::Unauthenticated("invalid token signature".to_owned())
        })?;
        decoded
            .payload()
            .map(|payload| payload.to_owned())
            .map_err(|err| AuthError::Internal(format!("Token payload missing: {err}")))
    }
}

/// Validates `Authorization: Bearer <JWT>` headers.
///
/// Temporal claims are checked against a configurable clock: `exp` and `nbf`
/// are enforced when present, and `iss`/`aud` are matched when configured.
/// Claims are turned into authentication metadata by a JMESPath expression
/// over the decoded claims set.
pub struct JwtAuthenticator {
    verifier: SignatureVerifier,
    expected_issuer: Option<String>,
    expected_audience: Option<String>,
    metadata_extractor: MetadataExtractor,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl JwtAuthenticator {
    pub fn new(
        verifier: SignatureVerifier,
        expected_issuer: Option<String>,
        expected_audience: Option<String>,
        metadata_extractor: MetadataExtractor,
    ) -> Self {
        Self::with_clock(
            verifier,
            expected_issuer,
            expected_audience,
            metadata_extractor,
            Arc::new(Utc::now),
        )
    }

    pub fn with_clock(
        verifier: SignatureVerifier,
        expected_issuer: Option<String>,
        expected_audience: Option<String>,
        metadata_extractor: MetadataExtractor,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        JwtAuthenticator {
            verifier,
            expected_issuer,
            expected_audience,
            metadata_extractor,
            clock,
        }
    }

    fn validate_claims(&self, claims: &ClaimsSet) -> Result<(), AuthError> {
        let validation_options = ValidationOptions {
            claim_presence_options: ClaimPresenceOptions::default(),
            temporal_options: TemporalOptions {
                epsilon: ChronoDuration::seconds(1),
                now: Some((self.clock)()),
            },
            issued_at: Validation::Ignored,
            expiry: Validation::Validate(()),
            not_before: Validation::Validate(()),
            // Matched below so that failures carry a useful message.
            issuer: Validation::Ignored,
            audience: Validation::Ignored,
        };
        claims
            .registered
            .validate(validation_options)
            .map_err(|err| {
                let message = match err {
                    ValidationError::Expired(_) => "token is expired".to_owned(),
                    ValidationError::NotYetValid(_) => "token is not yet valid".to_owned(),
                    other => format!("token validation failed: {other}"),
                };
                AuthError::Unauthenticated(message)
            })?;

        if let Some(expected_issuer) = &self.expected_issuer {
            match &claims.registered.issuer {
                Some(issuer) if issuer == expected_issuer => {}
                _ => {
                    return Err(AuthError::Unauthenticated(format!(
                        "token was not issued by {expected_issuer:?}"
                    )))
                }
            }
        }

        if let Some(expected_audience) = &self.expected_audience {
            match &claims.registered.audience {
                Some(audience) if audience.contains(expected_audience) => {}
                _ => {
                    return Err(AuthError::Unauthenticated(format!(
                        "token audience does not include {expected_audience:?}"
                    )))
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        context: &RequestContext<'_>,
    ) -> Result<AuthenticationMetadata, AuthError> {
        let token = get_bearer_token(context.metadata)?;
        let claims = self.verifier.decode(&token)?;
        self.validate_claims(&claims)?;

        let view = serde_json::to_value(&claims)
            .map_err(|err| AuthError::Internal(format!("Claims not serializable: {err}")))?;
        self.metadata_extractor.extract(&view)
    }
}

/// Fixed clock for tests and for deployments that inject their own time
/// source.
pub fn fixed_clock(timestamp: i64) -> Arc<dyn Fn() -> DateTime<Utc> + Send + Sync> {
    Arc::new(move || Utc.timestamp_opt(timestamp, 0).single().expect("valid timestamp"))
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use biscuit::jwa::{Algorithm, SignatureAlgorithm};
    use biscuit::jwk::JWK;
    use biscuit::{RegisteredClaims, SingleOrMultiple, Timestamp};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};

    use super::{fixed_clock, ClaimsSet, JwtAuthenticator, SignatureVerifier, JWT};
    use crate::jwks::{StaticJwks, JWKSet};
    use crate::{AuthError, Authenticator, MetadataExtractor, RequestContext};

    const TEST_SECRET: &[u8] = b"0123456789ABCDEF";
    const TEST_KEY_ID: &str = "my_key_id_1";
    const NOW: i64 = 1_600_000_000;

    fn make_jwk_set() -> JWKSet {
        let jwk = JWK {
            common: biscuit::jwk::CommonParameters {
                key_id: Some(TEST_KEY_ID.to_owned()),
                algorithm: Some(Algorithm::Signature(SignatureAlgorithm::HS256)),
                ..Default::default()
            },
            algorithm: biscuit::jwk::AlgorithmParameters::OctetKey(
                biscuit::jwk::OctetKeyParameters {
                    value: TEST_SECRET.to_vec(),
                    key_type: Default::default(),
                },
            ),
            additional: Default::default(),
        };
        JWKSet { keys: vec![jwk] }
    }

    fn generate_jwt(
        expiry: Option<i64>,
        issuer: Option<&str>,
        audience: Option<&str>,
        secret: &[u8],
    ) -> String {
        let claims = ClaimsSet {
            registered: RegisteredClaims {
                issuer: issuer.map(|i| i.to_owned()),
                audience: audience.map(|a| SingleOrMultiple::Single(a.to_owned())),
                expiry: expiry
                    .map(|e| Timestamp::from(Utc.timestamp_opt(e, 0).single().unwrap())),
                ..Default::default()
            },
            private: json!({"sub": "jane", "instance": "acme/ci"}),
        };
        let decoded = JWT::new_decoded(
            biscuit::jws::Header {
                registered: biscuit::jws::RegisteredHeader {
                    key_id: Some(TEST_KEY_ID.to_owned()),
                    ..Default::default()
                },
                private: Default::default(),
            },
            claims,
        );
        decoded
            .into_encoded(&biscuit::jws::Secret::Bytes(secret.to_vec()))
            .unwrap()
            .unwrap_encoded()
            .to_string()
    }

    fn authenticator(
        verifier: SignatureVerifier,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> JwtAuthenticator {
        JwtAuthenticator::with_clock(
            verifier,
            issuer.map(|i| i.to_owned()),
            audience.map(|a| a.to_owned()),
            MetadataExtractor::new("{public: {user: sub}}").unwrap(),
            fixed_clock(NOW),
        )
    }

    fn hmac_verifier() -> SignatureVerifier {
        SignatureVerifier::HmacSecret {
            secret: TEST_SECRET.to_vec(),
            algorithm: SignatureAlgorithm::HS256,
        }
    }

    async fn validate(
        authenticator: &JwtAuthenticator,
        token: &str,
    ) -> Result<crate::AuthenticationMetadata, AuthError> {
        let mut metadata = MetadataMap::new();
        metadata.insert(
            AsciiMetadataKey::from_str("authorization").unwrap(),
            AsciiMetadataValue::try_from(format!("Bearer {token}")).unwrap(),
        );
        authenticator
            .authenticate(&RequestContext::from_metadata(&metadata))
            .await
    }

    #[tokio::test]
    async fn valid_tokens_yield_metadata() {
        let authenticator = authenticator(hmac_verifier(), None, None);
        let token = generate_jwt(Some(NOW + 3600), None, None, TEST_SECRET);
        let metadata = validate(&authenticator, &token).await.unwrap();
        assert_eq!(metadata.public["user"], json!("jane"));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let authenticator = authenticator(hmac_verifier(), None, None);
        let token = generate_jwt(Some(NOW - 3600), None, None, TEST_SECRET);
        let err = validate(&authenticator, &token).await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Unauthenticated("token is expired".to_owned())
        );
    }

    #[tokio::test]
    async fn tokens_without_expiry_are_accepted() {
        let authenticator = authenticator(hmac_verifier(), None, None);
        let token = generate_jwt(None, None, None, TEST_SECRET);
        validate(&authenticator, &token).await.unwrap();
    }

    #[tokio::test]
    async fn bad_signatures_are_rejected() {
        let authenticator = authenticator(hmac_verifier(), None, None);
        let token = generate_jwt(Some(NOW + 3600), None, None, b"wrong_secret_val");
        let err = validate(&authenticator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");
    }

    #[tokio::test]
    async fn issuer_and_audience_are_enforced() {
        let authenticator =
            authenticator(hmac_verifier(), Some("https://issuer.example"), Some("cas"));

        let token = generate_jwt(None, Some("https://issuer.example"), Some("cas"), TEST_SECRET);
        validate(&authenticator, &token).await.unwrap();

        let token = generate_jwt(None, Some("https://evil.example"), Some("cas"), TEST_SECRET);
        let err = validate(&authenticator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");

        let token = generate_jwt(None, Some("https://issuer.example"), None, TEST_SECRET);
        let err = validate(&authenticator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");
    }

    #[tokio::test]
    async fn jwks_verifier_matches_by_key_id() {
        let authenticator = authenticator(
            SignatureVerifier::JwkSet(Arc::new(StaticJwks::new(make_jwk_set()))),
            None,
            None,
        );
        let token = generate_jwt(Some(NOW + 3600), None, None, TEST_SECRET);
        validate(&authenticator, &token).await.unwrap();

        let token = generate_jwt(Some(NOW + 3600), None, None, b"wrong_secret_val");
        let err = validate(&authenticator, &token).await.unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_header_is_unauthenticated() {
        let authenticator = authenticator(hmac_verifier(), None, None);
        let metadata = MetadataMap::new();
        let err = authenticator
            .authenticate(&RequestContext::from_metadata(&metadata))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthenticated(_)), "{err:?}");
    }
}
