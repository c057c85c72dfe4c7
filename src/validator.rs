// src/validator.rs

mod result;
mod token;

pub use result::{FailureKind, ValidatedToken, ValidationFailure, ValidationResult, Verification};
pub use token::{ParsedToken, TokenHeader, ROLE_CLAIM_URI};

use crate::config::ValidationConfig;
use crate::error::GuardError;
use crate::metadata::MetadataProvider;
use crate::model::{DiscoveryDocument, SigningKey};
use crate::retriever::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Hint attached to connectivity failures.
const DISABLE_HINT: &str =
    "Token validation can be disabled temporarily with TokenValidation__EnableValidation=false";

/// The bearer token validator.
///
/// Create it once and share it; `validate` is safe to call concurrently and
/// keeps no per-call state. Signing keys come from the shared [`MetadataProvider`].
#[derive(Clone)]
pub struct TokenValidator {
    config: ValidationConfig,
    metadata: MetadataProvider,
    clock: Arc<dyn Clock>,
}

/// Everything one validation is checked against, fixed once the metadata is known.
struct ValidationParameters<'a> {
    issuer: &'a str,
    /// `None` turns the audience check off.
    audience: Option<&'a str>,
    document: &'a DiscoveryDocument,
    clock_skew: chrono::Duration,
}

impl TokenValidator {
    /// Creates a validator that fetches metadata over HTTPS using the system clock.
    pub fn new(config: ValidationConfig) -> Self {
        let metadata = MetadataProvider::from_config(&config);
        Self::with_provider(config, metadata, Arc::new(SystemClock))
    }

    /// Creates a validator around an existing metadata provider and clock.
    pub fn with_provider(
        config: ValidationConfig,
        metadata: MetadataProvider,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if config.enabled {
            info!(
                "Token validator initialized. Metadata URL: {}, expected issuer: {}",
                metadata.metadata_address(),
                config.expected_issuer
            );
        } else {
            warn!("Token validator initialized with validation DISABLED; every token will be accepted");
        }
        Self {
            config,
            metadata,
            clock,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub fn metadata(&self) -> &MetadataProvider {
        &self.metadata
    }

    /// Validates a bearer token.
    ///
    /// Checks run in a fixed order: structure, local expiry (before any network
    /// call), signing key and signature, issuer, audience, lifetime with clock
    /// skew, and finally roles. The first failing check decides the result.
    /// When validation is disabled the token is accepted without inspection.
    #[instrument(skip(self, token, cancel))]
    pub async fn validate(&self, token: &str, cancel: &CancellationToken) -> ValidationResult {
        if !self.config.enabled {
            warn!("Token validation is disabled; accepting token without checks");
            return ValidationResult::Valid(ValidatedToken::unchecked());
        }

        match self.run_checks(token, cancel).await {
            Ok(validated) => {
                info!(
                    "Token validation successful. Roles: {}",
                    validated.roles.join(", ")
                );
                ValidationResult::Valid(validated)
            }
            Err(failure) => {
                match failure.kind {
                    FailureKind::NetworkUnavailable => error!(kind = %failure.kind, "{}", failure.message),
                    FailureKind::Cancelled => debug!("{}", failure.message),
                    kind => warn!(kind = %kind, systemic = kind.is_systemic(), "Token rejected: {}", failure.message),
                }
                ValidationResult::Invalid(failure)
            }
        }
    }

    async fn run_checks(
        &self,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidatedToken, ValidationFailure> {
        if cancel.is_cancelled() {
            return Err(ValidationFailure::cancelled());
        }

        // 1. Structure.
        let parsed = ParsedToken::parse(token)?;

        // 2. Local expiry, so expired tokens never cost a round trip.
        let now = self.clock.now();
        let expires_on = parsed
            .expires_at
            .ok_or_else(|| ValidationFailure::malformed("Token has no 'exp' claim"))?;
        if expires_on < now {
            return Err(ValidationFailure::new(
                FailureKind::Expired,
                format!("Token has expired (exp {})", expires_on.to_rfc3339()),
            ));
        }

        // 3. Metadata, then the key the token names.
        let algorithm = self.allowed_algorithm(&parsed)?;
        let document = self
            .metadata
            .get_configuration(cancel)
            .await
            .map_err(|e| self.metadata_failure(e))?;
        let document = self.resolve_document_with_key(&parsed, document, cancel).await?;

        let params = ValidationParameters {
            issuer: &self.config.expected_issuer,
            audience: self.config.audience.as_deref(),
            document: &document,
            clock_skew: self.config.clock_skew,
        };

        // 4. Signature, issuer, audience, lifetime.
        self.check_signature(&parsed, algorithm, &params)?;
        self.check_issuer(&parsed, &params)?;
        self.check_audience(&parsed, &params)?;
        Self::check_lifetime(&parsed, expires_on, now, &params)?;

        // 5. Roles.
        let roles = self.check_roles(&parsed)?;

        Ok(ValidatedToken {
            claims: parsed.claims,
            expires_on: Some(expires_on),
            roles,
            verification: Verification::Verified,
        })
    }

    fn allowed_algorithm(&self, parsed: &ParsedToken) -> Result<Algorithm, ValidationFailure> {
        let algorithm = Algorithm::from_str(&parsed.header.alg).map_err(|_| {
            ValidationFailure::new(
                FailureKind::InvalidSignature,
                format!("Unsupported signing algorithm '{}'", parsed.header.alg),
            )
        })?;
        if matches!(algorithm, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Err(ValidationFailure::new(
                FailureKind::InvalidSignature,
                format!("Symmetric algorithm {:?} cannot be verified with published keys", algorithm),
            ));
        }
        if !self.config.algorithms.contains(&algorithm) {
            return Err(ValidationFailure::new(
                FailureKind::InvalidSignature,
                format!("Signing algorithm {:?} is not allowed", algorithm),
            ));
        }
        Ok(algorithm)
    }

    /// Returns a document containing the token's key, refreshing once on a miss
    /// in case the provider rolled its keys.
    async fn resolve_document_with_key(
        &self,
        parsed: &ParsedToken,
        document: Arc<DiscoveryDocument>,
        cancel: &CancellationToken,
    ) -> Result<Arc<DiscoveryDocument>, ValidationFailure> {
        let kid = parsed.header.kid.as_deref();
        let x5t = parsed.header.x5t.as_deref();
        if document.find_key(kid, x5t).is_some() {
            return Ok(document);
        }

        let document = if self.metadata.request_refresh() {
            debug!("Signing key {:?} not in cached metadata; refreshing", kid.or(x5t));
            self.metadata
                .get_configuration(cancel)
                .await
                .map_err(|e| self.metadata_failure(e))?
        } else {
            document
        };

        if document.find_key(kid, x5t).is_some() {
            return Ok(document);
        }
        Err(ValidationFailure::new(
            FailureKind::InvalidSignature,
            match (kid, x5t) {
                (Some(kid), _) => format!("No signing key matches kid '{kid}'"),
                (None, Some(x5t)) => format!("No signing key matches x5t '{x5t}'"),
                (None, None) => "Token header names no signing key (kid or x5t)".to_string(),
            },
        ))
    }

    fn check_signature(
        &self,
        parsed: &ParsedToken,
        algorithm: Algorithm,
        params: &ValidationParameters<'_>,
    ) -> Result<(), ValidationFailure> {
        let invalid = |message: String| ValidationFailure::new(FailureKind::InvalidSignature, message);

        let key: &SigningKey = params
            .document
            .find_key(parsed.header.kid.as_deref(), parsed.header.x5t.as_deref())
            .ok_or_else(|| invalid("Signing key disappeared from metadata".to_string()))?;

        if let Some(key_algorithm) = key.algorithm {
            if key_algorithm != algorithm {
                return Err(invalid(format!(
                    "Token algorithm {:?} does not match key algorithm {:?}",
                    algorithm, key_algorithm
                )));
            }
        }

        match jsonwebtoken::crypto::verify(
            &parsed.encoded_signature,
            parsed.signed_content.as_bytes(),
            &key.decoding_key,
            algorithm,
        ) {
            Ok(true) => Ok(()),
            Ok(false) => Err(invalid("Token has invalid signature".to_string())),
            Err(e) => Err(invalid(format!("Token has invalid signature: {e}"))),
        }
    }

    fn check_issuer(
        &self,
        parsed: &ParsedToken,
        params: &ValidationParameters<'_>,
    ) -> Result<(), ValidationFailure> {
        let invalid = |message: String| ValidationFailure::new(FailureKind::InvalidIssuer, message);
        let issuer = parsed
            .issuer
            .as_deref()
            .ok_or_else(|| invalid("Token has no 'iss' claim".to_string()))?;

        if issuer != params.issuer {
            return Err(invalid(format!(
                "Token has invalid issuer '{}', expected '{}'",
                issuer, params.issuer
            )));
        }
        if !params
            .document
            .issuer_covers(issuer, self.config.tenant_id.as_deref())
        {
            return Err(invalid(format!(
                "Token issuer '{}' is not served by metadata issuer '{}'",
                issuer, params.document.issuer
            )));
        }
        Ok(())
    }

    fn check_audience(
        &self,
        parsed: &ParsedToken,
        params: &ValidationParameters<'_>,
    ) -> Result<(), ValidationFailure> {
        let Some(expected) = params.audience else {
            return Ok(());
        };
        if parsed.audiences.iter().any(|aud| aud == expected) {
            return Ok(());
        }
        let message = if parsed.audiences.is_empty() {
            "Token has no 'aud' claim".to_string()
        } else {
            format!(
                "Token has invalid audience [{}], expected '{}'",
                parsed.audiences.join(", "),
                expected
            )
        };
        Err(ValidationFailure::new(FailureKind::InvalidAudience, message))
    }

    fn check_lifetime(
        parsed: &ParsedToken,
        expires_on: DateTime<Utc>,
        now: DateTime<Utc>,
        params: &ValidationParameters<'_>,
    ) -> Result<(), ValidationFailure> {
        // Bounds that overflow the calendar are unbounded.
        let now_minus_skew = now.checked_sub_signed(params.clock_skew);
        if now_minus_skew.is_some_and(|bound| bound > expires_on) {
            return Err(ValidationFailure::new(
                FailureKind::Expired,
                format!("Token has expired (exp {})", expires_on.to_rfc3339()),
            ));
        }
        if let Some(not_before) = parsed.not_before {
            let now_plus_skew = now.checked_add_signed(params.clock_skew);
            if now_plus_skew.is_some_and(|bound| bound < not_before) {
                return Err(ValidationFailure::new(
                    FailureKind::Expired,
                    format!("Token is not valid before {}", not_before.to_rfc3339()),
                ));
            }
        }
        Ok(())
    }

    fn check_roles(&self, parsed: &ParsedToken) -> Result<Vec<String>, ValidationFailure> {
        let required = &self.config.required_roles;
        if required.is_empty() || required.iter().any(|role| parsed.roles.contains(role)) {
            return Ok(parsed.roles.clone());
        }
        Err(ValidationFailure::new(
            FailureKind::InsufficientRole,
            format!(
                "Token does not contain required roles: {}",
                required.join(", ")
            ),
        ))
    }

    fn metadata_failure(&self, error: GuardError) -> ValidationFailure {
        if matches!(error, GuardError::Cancelled) {
            return ValidationFailure::cancelled();
        }
        let cause = if error.is_network() {
            "Network connectivity issue: unable to reach the identity provider metadata endpoint"
        } else {
            "Identity provider metadata could not be used"
        };
        ValidationFailure::new(
            FailureKind::NetworkUnavailable,
            format!(
                "{} {} ({}). {}.",
                cause,
                self.metadata.metadata_address(),
                error,
                DISABLE_HINT
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde_json::json;

    fn parsed(claims: serde_json::Value) -> ParsedToken {
        let segment = |v: &serde_json::Value| URL_SAFE_NO_PAD.encode(serde_json::to_vec(v).unwrap());
        let raw = format!(
            "{}.{}.{}",
            segment(&json!({ "alg": "RS256", "kid": "k1" })),
            segment(&claims),
            URL_SAFE_NO_PAD.encode(b"sig")
        );
        ParsedToken::parse(&raw).unwrap()
    }

    fn document() -> DiscoveryDocument {
        DiscoveryDocument {
            issuer: "https://login.example/contoso".to_string(),
            jwks_uri: "https://login.example/keys".to_string(),
            authorization_endpoint: None,
            token_endpoint: None,
            end_session_endpoint: None,
            signing_keys: Vec::new(),
            fetched_at: Utc::now(),
        }
    }

    fn lifetime(claims: serde_json::Value, skew: chrono::Duration) -> Result<(), ValidationFailure> {
        let token = parsed(claims);
        let document = document();
        let params = ValidationParameters {
            issuer: "https://login.example/contoso",
            audience: None,
            document: &document,
            clock_skew: skew,
        };
        let expires_on = token.expires_at.unwrap();
        TokenValidator::check_lifetime(&token, expires_on, Utc::now(), &params)
    }

    #[test]
    fn lifetime_applies_skew_to_both_bounds() {
        let now = Utc::now().timestamp();
        let skew = chrono::Duration::minutes(5);

        assert!(lifetime(json!({ "exp": now - 60, "nbf": now - 600 }), skew).is_ok());
        assert!(lifetime(json!({ "exp": now + 600, "nbf": now + 60 }), skew).is_ok());

        let expired = lifetime(json!({ "exp": now - 600 }), skew).unwrap_err();
        assert_eq!(expired.kind, FailureKind::Expired);
        let early = lifetime(json!({ "exp": now + 3600, "nbf": now + 600 }), skew).unwrap_err();
        assert_eq!(early.kind, FailureKind::Expired);
    }

    #[test]
    fn calendar_overflowing_skew_does_not_panic() {
        let now = Utc::now().timestamp();
        let skew = chrono::Duration::seconds(10_000_000_000_000);
        assert!(lifetime(json!({ "exp": now - 600, "nbf": now + 600 }), skew).is_ok());
    }
}
