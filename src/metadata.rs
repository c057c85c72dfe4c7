// src/metadata.rs

use crate::config::{MetadataSettings, ValidationConfig};
use crate::error::GuardError;
use crate::model::{DiscoveryDocument, JsonWebKeySet, OidcDiscoveryDocument};
use crate::retriever::{Clock, DocumentRetriever, HttpDocumentRetriever, SystemClock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Supplies the identity provider's discovery document and signing keys,
/// cached and refreshed transparently.
///
/// The provider is a cheap-to-clone handle; clones share one cache.
#[derive(Clone)]
pub struct MetadataProvider {
    // The provider is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct CacheEntry {
    document: Arc<DiscoveryDocument>,
    /// Once this instant passes, the next caller re-fetches.
    sync_after: Instant,
}

struct Inner {
    metadata_address: Url,
    settings: MetadataSettings,
    retriever: Arc<dyn DocumentRetriever>,
    clock: Arc<dyn Clock>,
    // Replaced wholesale, never mutated in place.
    snapshot: RwLock<Option<Arc<CacheEntry>>>,
    // Single-flight guard around the network path.
    fetch_lock: tokio::sync::Mutex<()>,
    // Completed fetch attempts, successful or not.
    attempts: AtomicU64,
    last_failure: Mutex<Option<String>>,
    last_refresh_request: Mutex<Option<Instant>>,
}

impl MetadataProvider {
    /// Creates a provider for the discovery document at `metadata_address`.
    ///
    /// Nothing is fetched until the first call to [`get_configuration`](Self::get_configuration)
    /// or until [`spawn_refresh_loop`](Self::spawn_refresh_loop) runs.
    pub fn new(
        metadata_address: Url,
        settings: MetadataSettings,
        retriever: Arc<dyn DocumentRetriever>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                metadata_address,
                settings,
                retriever,
                clock,
                snapshot: RwLock::new(None),
                fetch_lock: tokio::sync::Mutex::new(()),
                attempts: AtomicU64::new(0),
                last_failure: Mutex::new(None),
                last_refresh_request: Mutex::new(None),
            }),
        }
    }

    /// Creates a provider that fetches over HTTPS and uses the system clock.
    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(
            config.metadata_address.clone(),
            config.metadata.clone(),
            Arc::new(HttpDocumentRetriever::new()),
            Arc::new(SystemClock),
        )
    }

    pub fn metadata_address(&self) -> &Url {
        &self.inner.metadata_address
    }

    /// Returns the cached document without touching the network.
    pub fn current(&self) -> Option<Arc<DiscoveryDocument>> {
        self.load_snapshot().map(|entry| entry.document.clone())
    }

    /// Returns the current discovery document.
    ///
    /// A cached document inside its validity window is returned immediately.
    /// Otherwise one caller fetches while concurrent callers wait for and share
    /// that result. If the fetch fails and a previously fetched document exists,
    /// the stale document is returned and the next attempt is deferred by the
    /// minimum refresh interval. Without any cached document the failure is returned.
    #[instrument(skip(self, cancel), fields(address = %self.inner.metadata_address), err)]
    pub async fn get_configuration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<DiscoveryDocument>, GuardError> {
        self.load_or_fetch(cancel, false).await
    }

    /// Marks the cached document for re-fetching on next use.
    ///
    /// Requests arriving within `refresh_interval` of the last accepted one are
    /// ignored. Returns whether the request was accepted.
    pub fn request_refresh(&self) -> bool {
        let now = Instant::now();
        let mut last = self
            .inner
            .last_refresh_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(previous) = *last {
            if now.duration_since(previous) < self.inner.settings.refresh_interval {
                debug!(
                    "Metadata refresh requested {:?} after the previous one; ignoring",
                    now.duration_since(previous)
                );
                return false;
            }
        }
        *last = Some(now);

        if let Some(entry) = self.load_snapshot() {
            self.store_snapshot(CacheEntry {
                document: entry.document.clone(),
                sync_after: now,
            });
        }
        info!("Metadata refresh requested for {}", self.inner.metadata_address);
        true
    }

    /// Requests a refresh and returns the resulting document.
    pub async fn refresh(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<DiscoveryDocument>, GuardError> {
        self.request_refresh();
        self.get_configuration(cancel).await
    }

    /// Spawns the background task that keeps the cache warm.
    ///
    /// The task fetches immediately, then again at 80% of the automatic refresh
    /// interval after every success, or after `refresh_interval` following a
    /// failure. It stops when `cancel` fires.
    pub fn spawn_refresh_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let provider = self.clone();
        tokio::spawn(async move {
            provider.refresh_loop(cancel).await;
        })
    }

    /// The main loop for the background refresh task.
    async fn refresh_loop(&self, cancel: CancellationToken) {
        loop {
            let delay = match self.load_or_fetch(&cancel, true).await {
                // A stale document was served; the fetch itself failed.
                Ok(_) if self.last_failure().is_some() => {
                    warn!(
                        "Background metadata refresh failed; serving cached document. Retrying in {:?}.",
                        self.inner.settings.refresh_interval
                    );
                    self.inner.settings.refresh_interval
                }
                Ok(_) => Duration::from_secs_f64(
                    self.inner.settings.automatic_refresh_interval.as_secs_f64() * 0.8,
                ),
                Err(GuardError::Cancelled) => break,
                Err(e) => {
                    error!(
                        "Failed to refresh metadata in background: {}. Retrying in {:?}.",
                        e, self.inner.settings.refresh_interval
                    );
                    self.inner.settings.refresh_interval
                }
            };
            // Never spin, whatever the configured intervals are.
            let delay = delay.max(Duration::from_secs(1));

            debug!("Metadata background refresh scheduled in {:?}", delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Metadata background refresh stopped");
    }

    async fn load_or_fetch(
        &self,
        cancel: &CancellationToken,
        force: bool,
    ) -> Result<Arc<DiscoveryDocument>, GuardError> {
        // Read before the cache check; attempts are counted after the snapshot is stored.
        let attempts_seen = self.inner.attempts.load(Ordering::Acquire);
        if !force {
            if let Some(entry) = self.load_snapshot() {
                if Instant::now() < entry.sync_after {
                    debug!("Metadata cache hit");
                    return Ok(entry.document.clone());
                }
            }
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GuardError::Cancelled),
            guard = self.inner.fetch_lock.lock() => guard,
        };

        // Another caller finished an attempt while we waited; share its outcome.
        if self.inner.attempts.load(Ordering::Acquire) != attempts_seen {
            if let Some(entry) = self.load_snapshot() {
                debug!("Using metadata fetched by a concurrent caller");
                return Ok(entry.document.clone());
            }
            let reason = self
                .last_failure()
                .unwrap_or_else(|| "metadata fetch failed".to_string());
            return Err(GuardError::MetadataUnavailable(reason));
        }

        let timeout = self.inner.settings.fetch_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GuardError::Cancelled),
            result = tokio::time::timeout(timeout, self.fetch()) => {
                result.unwrap_or_else(|_| Err(GuardError::Timeout(timeout)))
            }
        };
        let result = match outcome {
            Ok(document) => {
                info!(
                    "Fetched metadata from {}: issuer {}, {} signing keys",
                    self.inner.metadata_address,
                    document.issuer,
                    document.signing_keys.len()
                );
                let document = Arc::new(document);
                self.store_snapshot(CacheEntry {
                    document: document.clone(),
                    sync_after: Instant::now() + self.inner.settings.automatic_refresh_interval,
                });
                *self
                    .inner
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = None;
                Ok(document)
            }
            Err(e) => {
                *self
                    .inner
                    .last_failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());

                match self.load_snapshot() {
                    Some(stale) => {
                        warn!(
                            "Metadata refresh from {} failed ({}); serving document fetched at {}",
                            self.inner.metadata_address, e, stale.document.fetched_at
                        );
                        self.store_snapshot(CacheEntry {
                            document: stale.document.clone(),
                            sync_after: Instant::now() + self.inner.settings.refresh_interval,
                        });
                        Ok(stale.document.clone())
                    }
                    None => {
                        error!(
                            "Metadata fetch from {} failed with no cached copy: {}",
                            self.inner.metadata_address, e
                        );
                        Err(e)
                    }
                }
            }
        };
        self.inner.attempts.fetch_add(1, Ordering::AcqRel);
        result
    }

    /// Fetches the discovery document and the key set it points to.
    async fn fetch(&self) -> Result<DiscoveryDocument, GuardError> {
        let address = &self.inner.metadata_address;
        let raw = self.inner.retriever.get_document(address).await?;
        let discovery: OidcDiscoveryDocument = serde_json::from_slice(&raw).map_err(|e| {
            GuardError::InvalidDocument(format!("discovery document at {address}: {e}"))
        })?;

        let jwks_uri = Url::parse(&discovery.jwks_uri)
            .map_err(|e| GuardError::InvalidUrl(format!("{}: {e}", discovery.jwks_uri)))?;
        debug!("Discovered JWKS URI: {}", jwks_uri);

        let raw = self.inner.retriever.get_document(&jwks_uri).await?;
        let jwks: JsonWebKeySet = serde_json::from_slice(&raw)
            .map_err(|e| GuardError::InvalidDocument(format!("key set at {jwks_uri}: {e}")))?;

        DiscoveryDocument::from_parts(discovery, jwks, self.inner.clock.now())
    }

    /// The error of the latest fetch attempt, if it failed.
    fn last_failure(&self) -> Option<String> {
        self.inner
            .last_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn load_snapshot(&self) -> Option<Arc<CacheEntry>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_snapshot(&self, entry: CacheEntry) {
        *self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(entry));
    }
}
