// src/retriever.rs

//! Boundaries to the outside world: fetching metadata documents and reading
//! the current time. Both are traits so tests can script the identity provider
//! and pin the clock.

use crate::error::GuardError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

/// Fetches the raw bytes of a metadata document (discovery document or key set).
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    async fn get_document(&self, address: &Url) -> Result<Vec<u8>, GuardError>;
}

/// A [`DocumentRetriever`] backed by `reqwest`.
///
/// Only HTTPS addresses are fetched, except for loopback hosts.
#[derive(Clone, Default)]
pub struct HttpDocumentRetriever {
    http_client: reqwest::Client,
}

impl HttpDocumentRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a preconfigured client, e.g. one with a proxy or custom roots.
    pub fn with_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }
}

fn is_loopback(address: &Url) -> bool {
    match address.host() {
        Some(url::Host::Domain(host)) => host == "localhost",
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[async_trait]
impl DocumentRetriever for HttpDocumentRetriever {
    async fn get_document(&self, address: &Url) -> Result<Vec<u8>, GuardError> {
        if address.scheme() != "https" && !is_loopback(address) {
            return Err(GuardError::InsecureAddress(address.to_string()));
        }

        debug!("Fetching metadata document from {}", address);
        let response = self
            .http_client
            .get(address.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GuardError::UnexpectedStatus {
                address: address.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Source of "now" for every temporal comparison.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
