// src/validator/result.rs

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::fmt;

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Not three decodable segments, or a mandatory claim is missing or mistyped.
    MalformedToken,
    /// Outside its `exp` / `nbf` window.
    Expired,
    /// No matching signing key, a disallowed algorithm, or a bad signature.
    InvalidSignature,
    InvalidIssuer,
    InvalidAudience,
    /// None of the required roles is present.
    InsufficientRole,
    /// Provider metadata could not be obtained.
    NetworkUnavailable,
    /// The caller cancelled the validation.
    Cancelled,
}

impl FailureKind {
    /// Whether the failure points at the deployment (connectivity, tenant or
    /// audience configuration) rather than at the presented token.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            FailureKind::NetworkUnavailable | FailureKind::InvalidIssuer | FailureKind::InvalidAudience
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::MalformedToken => "MalformedToken",
            FailureKind::Expired => "Expired",
            FailureKind::InvalidSignature => "InvalidSignature",
            FailureKind::InvalidIssuer => "InvalidIssuer",
            FailureKind::InvalidAudience => "InvalidAudience",
            FailureKind::InsufficientRole => "InsufficientRole",
            FailureKind::NetworkUnavailable => "NetworkUnavailable",
            FailureKind::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

/// A rejected token: one classification and an operator-facing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MalformedToken, message)
    }

    pub(crate) fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "Token validation was cancelled")
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// How a token came to be accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Every check ran and passed.
    Verified,
    /// Validation is switched off; nothing was checked.
    ConfigurationDisabled,
}

/// An accepted token.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedToken {
    /// Every claim in the token payload.
    pub claims: Map<String, Value>,
    pub expires_on: Option<DateTime<Utc>>,
    /// Roles granted by the token, in the order they were found.
    pub roles: Vec<String>,
    pub verification: Verification,
}

impl ValidatedToken {
    pub(crate) fn unchecked() -> Self {
        Self {
            claims: Map::new(),
            expires_on: None,
            roles: Vec::new(),
            verification: Verification::ConfigurationDisabled,
        }
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    /// The `sub` claim.
    pub fn subject(&self) -> Option<&str> {
        self.claim("sub").and_then(Value::as_str)
    }

    /// The `tid` (tenant) claim.
    pub fn tenant_id(&self) -> Option<&str> {
        self.claim("tid").and_then(Value::as_str)
    }
}

/// The outcome of [`crate::validator::TokenValidator::validate`].
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid(ValidatedToken),
    Invalid(ValidationFailure),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid(_))
    }

    /// The failure classification, if the token was rejected.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            ValidationResult::Valid(_) => None,
            ValidationResult::Invalid(failure) => Some(failure.kind),
        }
    }

    pub fn into_result(self) -> Result<ValidatedToken, ValidationFailure> {
        match self {
            ValidationResult::Valid(token) => Ok(token),
            ValidationResult::Invalid(failure) => Err(failure),
        }
    }
}

impl From<Result<ValidatedToken, ValidationFailure>> for ValidationResult {
    fn from(result: Result<ValidatedToken, ValidationFailure>) -> Self {
        match result {
            Ok(token) => ValidationResult::Valid(token),
            Err(failure) => ValidationResult::Invalid(failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemic_failures() {
        assert!(FailureKind::NetworkUnavailable.is_systemic());
        assert!(FailureKind::InvalidAudience.is_systemic());
        assert!(!FailureKind::Expired.is_systemic());
        assert!(!FailureKind::InsufficientRole.is_systemic());
    }

    #[test]
    fn failure_display_includes_classification() {
        let failure = ValidationFailure::new(FailureKind::Expired, "Token has expired");
        assert_eq!(failure.to_string(), "Expired: Token has expired");
    }

    #[test]
    fn result_accessors() {
        let valid = ValidationResult::Valid(ValidatedToken::unchecked());
        assert!(valid.is_valid());
        assert_eq!(valid.failure_kind(), None);

        let invalid: ValidationResult =
            Err(ValidationFailure::malformed("Token is not a valid JWT")).into();
        assert_eq!(invalid.failure_kind(), Some(FailureKind::MalformedToken));
        assert!(invalid.into_result().is_err());
    }
}
