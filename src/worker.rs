// src/worker.rs

//! A cooperative polling task that validates its own bearer token before
//! calling a protected API, as a client of the validator would.

use crate::config::ApiSettings;
use crate::error::GuardError;
use crate::validator::{TokenValidator, ValidationFailure, ValidationResult};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use url::Url;

/// Flips to ready after the first successful authenticated API round trip.
#[derive(Debug, Default, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Supplies the bearer token the worker presents to the API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, GuardError>;
}

/// Reads the token from a file on every call, so a sidecar can rotate it.
#[derive(Debug, Clone)]
pub struct FileTokenSource {
    path: PathBuf,
}

impl FileTokenSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TokenSource for FileTokenSource {
    async fn token(&self) -> Result<String, GuardError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let token = raw.trim();
        if token.is_empty() {
            return Err(GuardError::InvalidConfiguration(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token.to_string())
    }
}

/// What one polling iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The token failed validation; the API was not called.
    Rejected(ValidationFailure),
    /// The API answered successfully.
    Completed { status: u16 },
}

/// Periodically validates a token and calls the API with it.
pub struct ApiPoller {
    validator: TokenValidator,
    tokens: Arc<dyn TokenSource>,
    http_client: reqwest::Client,
    endpoint: Url,
    interval: Duration,
    readiness: ReadinessState,
}

impl ApiPoller {
    pub fn new(
        validator: TokenValidator,
        tokens: Arc<dyn TokenSource>,
        settings: &ApiSettings,
        readiness: ReadinessState,
    ) -> Result<Self, GuardError> {
        let endpoint = Url::parse(&settings.endpoint)
            .map_err(|e| GuardError::InvalidUrl(format!("{}: {e}", settings.endpoint)))?;
        Ok(Self {
            validator,
            tokens,
            http_client: reqwest::Client::new(),
            endpoint,
            interval: settings.poll_interval,
            readiness,
        })
    }

    pub fn readiness(&self) -> &ReadinessState {
        &self.readiness
    }

    /// Runs one iteration: fetch token, validate, call the API.
    #[instrument(skip(self, cancel), fields(endpoint = %self.endpoint))]
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollOutcome, GuardError> {
        let token = self.tokens.token().await?;

        match self.validator.validate(&token, cancel).await {
            ValidationResult::Invalid(failure) => {
                error!("Token validation failed: {}", failure);
                info!("Skipping API call due to invalid token");
                return Ok(PollOutcome::Rejected(failure));
            }
            ValidationResult::Valid(validated) => {
                info!(
                    "Token validation successful. Token expires on: {:?}, Roles: {}",
                    validated.expires_on,
                    validated.roles.join(", ")
                );
            }
        }

        let response = self
            .http_client
            .get(self.endpoint.clone())
            .bearer_auth(&token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GuardError::UnexpectedStatus {
                address: self.endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await?;
        info!("API response status: {}", status);
        info!("API response body: {}", body);

        self.readiness.mark_ready();
        Ok(PollOutcome::Completed {
            status: status.as_u16(),
        })
    }

    /// Polls until `cancel` fires. A failed iteration is logged and retried
    /// after the regular interval.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            info!("Poll start: utc={}", Utc::now().to_rfc3339());
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.poll_once(&cancel) => {
                    if let Err(e) = result {
                        error!("API request failed: {}", e);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::validator::FailureKind;
    use std::io::Write;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct StaticToken(&'static str);

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn token(&self) -> Result<String, GuardError> {
            Ok(self.0.to_string())
        }
    }

    fn poller(server: &MockServer, enabled: bool, token: &'static str) -> ApiPoller {
        let config = ConfigBuilder::new()
            .tenant_id("contoso")
            .enabled(enabled)
            .metadata_address(&format!("{}/common/v2.0/.well-known/openid-configuration", server.uri()))
            .unwrap()
            .build()
            .unwrap();
        let settings = ApiSettings {
            endpoint: format!("{}/weatherforecast", server.uri()),
            token_file: None,
            poll_interval: Duration::from_millis(10),
        };
        ApiPoller::new(
            TokenValidator::new(config),
            Arc::new(StaticToken(token)),
            &settings,
            ReadinessState::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn successful_call_marks_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weatherforecast"))
            .and(header("authorization", "Bearer opaque-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .expect(1)
            .mount(&server)
            .await;

        let poller = poller(&server, false, "opaque-token");
        assert!(!poller.readiness().is_ready());

        let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PollOutcome::Completed { status: 200 });
        assert!(poller.readiness().is_ready());
    }

    #[tokio::test]
    async fn invalid_token_skips_the_call() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weatherforecast"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let poller = poller(&server, true, "not.a.jwt");
        let outcome = poller.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Rejected(ValidationFailure { kind: FailureKind::MalformedToken, .. })
        ));
        assert!(!poller.readiness().is_ready());
    }

    #[tokio::test]
    async fn api_error_is_reported_and_not_ready() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weatherforecast"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let poller = poller(&server, false, "opaque-token");
        let err = poller.poll_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GuardError::UnexpectedStatus { status: 500, .. }));
        assert!(!poller.readiness().is_ready());
    }

    #[tokio::test]
    async fn run_keeps_polling_until_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weatherforecast"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let poller = poller(&server, false, "opaque-token");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests.len() >= 2, "failed iterations must be retried");
    }

    #[tokio::test]
    async fn file_token_source_trims_and_rejects_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  eyJ.token.value  ").unwrap();
        let source = FileTokenSource::new(file.path());
        assert_eq!(source.token().await.unwrap(), "eyJ.token.value");

        let empty = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            FileTokenSource::new(empty.path()).token().await,
            Err(GuardError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            FileTokenSource::new("/nonexistent/token").token().await,
            Err(GuardError::Io(_))
        ));
    }
}
