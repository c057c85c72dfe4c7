// src/lib.rs

//! Bearer token validation against an Entra ID (Azure AD) style identity
//! provider.
//!
//! A [`validator::TokenValidator`] checks structure, expiry, signature, issuer,
//! audience and roles, fetching signing keys through a shared
//! [`metadata::MetadataProvider`] that caches the provider's discovery
//! document and refreshes it in the background.

pub mod config;
pub mod error;
pub mod metadata;
pub mod model;
pub mod retriever;
pub mod validator;
pub mod worker;

/// The public prelude for the `entra-guard` crate.
///
/// This module re-exports the most commonly used types for convenience.
pub mod prelude {
    pub use crate::config::{ConfigBuilder, MetadataSettings, Settings, ValidationConfig};
    pub use crate::error::GuardError;
    pub use crate::metadata::MetadataProvider;
    pub use crate::model::{DiscoveryDocument, SigningKey};
    pub use crate::retriever::{Clock, DocumentRetriever, HttpDocumentRetriever, SystemClock};
    pub use crate::validator::{
        FailureKind, TokenValidator, ValidatedToken, ValidationFailure, ValidationResult,
        Verification,
    };
    pub use crate::worker::{ApiPoller, FileTokenSource, ReadinessState, TokenSource};
    pub use jsonwebtoken::Algorithm;
    pub use tokio_util::sync::CancellationToken;
}
