// src/error.rs

use std::time::Duration;
use thiserror::Error;

/// The primary error type for the `entra-guard` library.
///
/// Token validation itself never fails with this type: every rejection is
/// reported through [`crate::validator::ValidationResult`]. `GuardError` covers
/// construction-time problems and the metadata fetch path.
#[derive(Debug, Error)]
pub enum GuardError {
    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A local file (settings or token) could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// An error occurred during an HTTP request.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The identity provider answered with a non-success status.
    #[error("Unexpected HTTP status {status} from {address}")]
    UnexpectedStatus { address: String, status: u16 },

    /// Metadata must be retrieved over HTTPS.
    #[error("Metadata address must use HTTPS: {0}")]
    InsecureAddress(String),

    /// The discovery document or key set could not be interpreted.
    #[error("Invalid metadata document: {0}")]
    InvalidDocument(String),

    /// A JSON Web Key is malformed or uses an unsupported key type.
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// The metadata fetch did not complete within the configured bound.
    #[error("Metadata fetch timed out after {0:?}")]
    Timeout(Duration),

    /// A concurrent fetch that this caller was waiting on failed.
    #[error("Metadata unavailable: {0}")]
    MetadataUnavailable(String),

    /// The caller's cancellation signal fired.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl GuardError {
    /// Returns `true` for failures that mean the identity provider could not be
    /// reached or did not answer usefully.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            GuardError::Http(_)
                | GuardError::UnexpectedStatus { .. }
                | GuardError::Timeout(_)
                | GuardError::MetadataUnavailable(_)
        )
    }
}
