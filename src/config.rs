// src/config.rs

use crate::error::GuardError;
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// The identity provider instance used when none is configured.
pub const DEFAULT_INSTANCE: &str = "https://login.microsoftonline.com/";

/// The API endpoint polled by the worker when none is configured.
pub const DEFAULT_API_ENDPOINT: &str = "http://sampleapi/weatherforecast";

/// Environment variable naming the settings file read by the binary.
pub const CONFIG_PATH_VAR: &str = "ENTRA_GUARD_CONFIG";

/// The largest clock skew tolerance `build` accepts.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(24 * 60 * 60);

/// Controls how the metadata provider caches and refreshes the discovery document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataSettings {
    /// How long a fetched document is served before it is re-fetched.
    /// Defaults to 24 hours.
    pub automatic_refresh_interval: Duration,
    /// The minimum time between two refreshes, and the retry delay after a
    /// failed one. Defaults to 30 minutes.
    pub refresh_interval: Duration,
    /// Upper bound for one complete fetch (discovery document plus key set).
    /// Defaults to 30 seconds.
    pub fetch_timeout: Duration,
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            automatic_refresh_interval: Duration::from_secs(24 * 60 * 60),
            refresh_interval: Duration::from_secs(30 * 60),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// The validated, immutable settings for the token validator.
///
/// Construct it with [`ConfigBuilder`] or from layered sources with [`Settings::load`].
#[derive(Clone, Debug)]
pub struct ValidationConfig {
    /// Root URL of the identity provider instance.
    pub instance: Url,
    /// Directory (tenant) identifier.
    pub tenant_id: Option<String>,
    /// Expected `aud` claim. Audience checking is skipped when `None`.
    pub audience: Option<String>,
    /// Any one of these roles grants access. Empty means no role gate.
    pub required_roles: Vec<String>,
    /// When `false` every token is accepted without inspection.
    pub enabled: bool,
    /// Tolerance applied to `exp` and `nbf` comparisons.
    pub clock_skew: chrono::Duration,
    /// Signing algorithms accepted in token headers.
    pub algorithms: Vec<Algorithm>,
    /// The exact `iss` value tokens must carry.
    pub expected_issuer: String,
    /// Location of the OpenID Connect discovery document.
    pub metadata_address: Url,
    pub metadata: MetadataSettings,
}

/// A builder for creating a `ValidationConfig` instance.
pub struct ConfigBuilder {
    instance: Option<Url>,
    tenant_id: Option<String>,
    audience: Option<String>,
    required_roles: Vec<String>,
    enabled: bool,
    clock_skew: Duration,
    algorithms: Vec<Algorithm>,
    issuer: Option<String>,
    metadata_address: Option<Url>,
    metadata: MetadataSettings,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            instance: None,
            tenant_id: None,
            audience: None,
            required_roles: Vec::new(),
            enabled: true,
            clock_skew: Duration::from_secs(5 * 60),
            // Entra ID signs access tokens with RS256.
            algorithms: vec![Algorithm::RS256],
            issuer: None,
            metadata_address: None,
            metadata: MetadataSettings::default(),
        }
    }
}

fn parse_http_url(url: &str) -> Result<Url, GuardError> {
    let parsed = Url::parse(url).map_err(|e| GuardError::InvalidUrl(format!("{url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(GuardError::InvalidUrl(format!(
            "{url}: expected an absolute http(s) URL"
        )));
    }
    Ok(parsed)
}

impl ConfigBuilder {
    /// Creates a new `ConfigBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the identity provider instance, e.g. "https://login.microsoftonline.com/".
    /// Defaults to [`DEFAULT_INSTANCE`].
    pub fn instance(mut self, url: &str) -> Result<Self, GuardError> {
        self.instance = Some(parse_http_url(url)?);
        Ok(self)
    }

    /// Sets the tenant identifier used to compute the expected issuer.
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the expected audience (the API's client ID). Optional; when it is
    /// never set, the `aud` claim is not checked.
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn required_roles(mut self, roles: Vec<String>) -> Self {
        self.required_roles = roles;
        self
    }

    /// Turns validation on or off. Turning it off accepts every token.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the clock skew tolerance. Defaults to 5 minutes, at most [`MAX_CLOCK_SKEW`].
    pub fn clock_skew(mut self, skew: Duration) -> Self {
        self.clock_skew = skew;
        self
    }

    /// Sets the allowed signing algorithms.
    /// Defaults to `[Algorithm::RS256]` if not set.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.algorithms = algorithms;
        self
    }

    /// Pins the expected issuer instead of deriving it from instance and tenant.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Overrides the discovery document location.
    pub fn metadata_address(mut self, url: &str) -> Result<Self, GuardError> {
        self.metadata_address = Some(parse_http_url(url)?);
        Ok(self)
    }

    pub fn automatic_refresh_interval(mut self, interval: Duration) -> Self {
        self.metadata.automatic_refresh_interval = interval;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.metadata.refresh_interval = interval;
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.metadata.fetch_timeout = timeout;
        self
    }

    /// Consumes the builder and returns a `ValidationConfig` object.
    ///
    /// # Errors
    ///
    /// Returns an error if validation is enabled but no issuer can be derived
    /// (neither a tenant nor an explicit issuer), or if no algorithm is allowed.
    pub fn build(self) -> Result<ValidationConfig, GuardError> {
        let instance = match self.instance {
            Some(instance) => instance,
            None => parse_http_url(DEFAULT_INSTANCE)?,
        };
        let root = instance.as_str().trim_end_matches('/').to_string();

        let tenant_id = self.tenant_id.filter(|t| !t.trim().is_empty());
        let audience = self.audience.filter(|a| !a.trim().is_empty());
        let issuer = self.issuer.filter(|i| !i.trim().is_empty());

        let expected_issuer = match (issuer, &tenant_id) {
            (Some(issuer), _) => issuer,
            (None, Some(tenant)) => format!("{root}/{tenant}"),
            (None, None) if self.enabled => {
                return Err(GuardError::MissingConfiguration("tenant_id".to_string()))
            }
            (None, None) => String::new(),
        };

        if self.clock_skew > MAX_CLOCK_SKEW {
            return Err(GuardError::InvalidConfiguration(format!(
                "clock skew {:?} exceeds the maximum of {:?}",
                self.clock_skew, MAX_CLOCK_SKEW
            )));
        }
        let clock_skew = chrono::Duration::from_std(self.clock_skew).map_err(|e| {
            GuardError::InvalidConfiguration(format!("clock skew {:?}: {e}", self.clock_skew))
        })?;

        if self.enabled && self.algorithms.is_empty() {
            return Err(GuardError::InvalidConfiguration(
                "at least one signing algorithm must be allowed".to_string(),
            ));
        }

        let metadata_address = match self.metadata_address {
            Some(address) => address,
            None => parse_http_url(&format!(
                "{root}/common/v2.0/.well-known/openid-configuration"
            ))?,
        };

        Ok(ValidationConfig {
            instance,
            tenant_id,
            audience,
            required_roles: self
                .required_roles
                .into_iter()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
            enabled: self.enabled,
            clock_skew,
            algorithms: self.algorithms,
            expected_issuer,
            metadata_address,
            metadata: self.metadata,
        })
    }
}

/// The `TokenValidation` section of the settings file.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TokenValidationSection {
    pub tenant_id: Option<String>,
    pub api_client_id: Option<String>,
    pub required_roles: Option<Vec<String>>,
    pub instance: Option<String>,
    pub enable_validation: Option<bool>,
    pub clock_skew_seconds: Option<u64>,
    pub metadata_address: Option<String>,
    pub issuer: Option<String>,
}

/// The legacy `AzureAd` section, consulted only as a fallback.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct AzureAdSection {
    pub tenant_id: Option<String>,
    pub instance: Option<String>,
}

/// The `Api` section used by the polling worker.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApiSection {
    pub endpoint: Option<String>,
    pub token_file: Option<PathBuf>,
    pub poll_interval_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct SettingsFile {
    token_validation: TokenValidationSection,
    azure_ad: AzureAdSection,
    api: ApiSection,
}

/// Resolved settings for the polling worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiSettings {
    pub endpoint: String,
    pub token_file: Option<PathBuf>,
    pub poll_interval: Duration,
}

/// Process settings after layering the environment over the settings file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub token_validation: TokenValidationSection,
    pub api: ApiSettings,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, GuardError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(GuardError::InvalidConfiguration(format!(
            "{key}: '{other}' is not a boolean"
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, GuardError> {
    value.trim().parse().map_err(|_| {
        GuardError::InvalidConfiguration(format!("{key}: '{value}' is not a whole number"))
    })
}

/// Reads a list either as `Key=a,b` or as indexed `Key__0`, `Key__1`, ...
fn env_list<F>(env: &F, key: &str) -> Option<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(joined) = non_empty(env(key)) {
        return Some(
            joined
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        );
    }
    let indexed: Vec<String> = (0..)
        .map_while(|i| env(&format!("{key}__{i}")))
        .collect();
    if indexed.is_empty() {
        None
    } else {
        Some(indexed)
    }
}

impl Settings {
    /// Loads settings from an optional file and an environment lookup.
    ///
    /// Precedence, highest first: `TokenValidation__*` / `Api__*` variables,
    /// the file's `TokenValidation` / `Api` sections, then the legacy sources
    /// (`AzureAd` section or `AzureAd__*` variables, `AZURE_TENANT_ID`,
    /// `API_CLIENT_ID`, `API_ENDPOINT`). A missing file is not an error.
    pub fn load<F>(path: Option<&Path>, env: F) -> Result<Self, GuardError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)?;
                if raw.trim().is_empty() {
                    SettingsFile::default()
                } else {
                    serde_yaml::from_str(&raw)?
                }
            }
            _ => SettingsFile::default(),
        };

        let tv = file.token_validation;
        let var = |key: &str| non_empty(env(key));

        let tenant_id = var("TokenValidation__TenantId")
            .or(non_empty(tv.tenant_id))
            .or_else(|| var("AzureAd__TenantId"))
            .or(non_empty(file.azure_ad.tenant_id))
            .or_else(|| var("AZURE_TENANT_ID"));

        let api_client_id = var("TokenValidation__ApiClientId")
            .or(non_empty(tv.api_client_id))
            .or_else(|| var("API_CLIENT_ID"));

        let instance = var("TokenValidation__Instance")
            .or(non_empty(tv.instance))
            .or_else(|| var("AzureAd__Instance"))
            .or(non_empty(file.azure_ad.instance));

        let required_roles = env_list(&env, "TokenValidation__RequiredRoles").or(tv.required_roles);

        let enable_validation = match var("TokenValidation__EnableValidation") {
            Some(v) => Some(parse_bool("TokenValidation__EnableValidation", &v)?),
            None => tv.enable_validation,
        };

        let clock_skew_seconds = match var("TokenValidation__ClockSkewSeconds") {
            Some(v) => Some(parse_u64("TokenValidation__ClockSkewSeconds", &v)?),
            None => tv.clock_skew_seconds,
        };

        let token_validation = TokenValidationSection {
            tenant_id,
            api_client_id,
            required_roles,
            instance,
            enable_validation,
            clock_skew_seconds,
            metadata_address: var("TokenValidation__MetadataAddress").or(non_empty(tv.metadata_address)),
            issuer: var("TokenValidation__Issuer").or(non_empty(tv.issuer)),
        };

        let poll_interval_seconds = match var("Api__PollIntervalSeconds") {
            Some(v) => Some(parse_u64("Api__PollIntervalSeconds", &v)?),
            None => file.api.poll_interval_seconds,
        };

        let api = ApiSettings {
            endpoint: var("Api__Endpoint")
                .or(non_empty(file.api.endpoint))
                .or_else(|| var("API_ENDPOINT"))
                .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            token_file: var("Api__TokenFile")
                .map(PathBuf::from)
                .or(file.api.token_file),
            poll_interval: Duration::from_secs(poll_interval_seconds.unwrap_or(60)),
        };

        Ok(Self {
            token_validation,
            api,
        })
    }

    /// Loads settings using the process environment.
    pub fn from_process_env(path: Option<&Path>) -> Result<Self, GuardError> {
        Self::load(path, |key| std::env::var(key).ok())
    }

    /// Converts the layered settings into a validated `ValidationConfig`.
    pub fn validation_config(&self) -> Result<ValidationConfig, GuardError> {
        let tv = &self.token_validation;
        let mut builder = ConfigBuilder::new()
            .instance(tv.instance.as_deref().unwrap_or(DEFAULT_INSTANCE))?
            .enabled(tv.enable_validation.unwrap_or(true));

        if let Some(tenant) = &tv.tenant_id {
            builder = builder.tenant_id(tenant.clone());
        }
        if let Some(audience) = &tv.api_client_id {
            builder = builder.audience(audience.clone());
        }
        if let Some(roles) = &tv.required_roles {
            builder = builder.required_roles(roles.clone());
        }
        if let Some(secs) = tv.clock_skew_seconds {
            builder = builder.clock_skew(Duration::from_secs(secs));
        }
        if let Some(address) = &tv.metadata_address {
            builder = builder.metadata_address(address)?;
        }
        if let Some(issuer) = &tv.issuer {
            builder = builder.issuer(issuer.clone());
        }
        builder.build()
    }
}

impl FromStr for ValidationConfig {
    type Err = GuardError;

    /// Parses a settings document (JSON or YAML) with no environment overrides.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let file: SettingsFile = serde_yaml::from_str(s)?;
        let settings = Settings {
            token_validation: TokenValidationSection {
                tenant_id: non_empty(file.token_validation.tenant_id).or(non_empty(file.azure_ad.tenant_id)),
                instance: non_empty(file.token_validation.instance).or(non_empty(file.azure_ad.instance)),
                ..file.token_validation
            },
            api: ApiSettings {
                endpoint: DEFAULT_API_ENDPOINT.to_string(),
                token_file: None,
                poll_interval: Duration::from_secs(60),
            },
        };
        settings.validation_config()
    }
}
