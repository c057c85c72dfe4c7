// src/model.rs

use crate::error::GuardError;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Represents the data structure of an OIDC provider's discovery document.
/// Found at the `.well-known/openid-configuration` endpoint.
#[derive(Debug, Deserialize)]
pub struct OidcDiscoveryDocument {
    pub issuer: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Represents a single JSON Web Key (JWK) as defined in RFC 7517.
#[derive(Debug, Deserialize)]
pub struct JsonWebKey {
    #[serde(default)]
    pub kid: Option<String>,
    pub kty: String,
    #[serde(rename = "use")]
    pub use_purpose: Option<String>,
    pub alg: Option<String>,
    pub x5t: Option<String>,
    // RSA
    pub n: Option<String>,
    pub e: Option<String>,
    // EC
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

/// Represents a JSON Web Key Set (JWKS), which is a collection of JWKs.
#[derive(Debug, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

/// A verification key resolved from the provider's key set.
#[derive(Clone)]
pub struct SigningKey {
    pub kid: Option<String>,
    pub x5t: Option<String>,
    /// The algorithm the provider pinned this key to, if any.
    pub algorithm: Option<Algorithm>,
    pub decoding_key: DecodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("x5t", &self.x5t)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Resolves a JWK into a usable key. Encryption keys are rejected.
    pub fn from_jwk(jwk: &JsonWebKey) -> Result<Self, GuardError> {
        if jwk.use_purpose.as_deref().is_some_and(|u| u != "sig") {
            return Err(GuardError::InvalidKeyFormat(format!(
                "key is not a signing key (use = {:?})",
                jwk.use_purpose
            )));
        }

        let decoding_key = match jwk.kty.as_str() {
            "RSA" => {
                let n = jwk.n.as_deref().ok_or_else(|| {
                    GuardError::InvalidKeyFormat("RSA key missing 'n' component".to_string())
                })?;
                let e = jwk.e.as_deref().ok_or_else(|| {
                    GuardError::InvalidKeyFormat("RSA key missing 'e' component".to_string())
                })?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| GuardError::InvalidKeyFormat(e.to_string()))?
            }
            "EC" => {
                let x = jwk.x.as_deref().ok_or_else(|| {
                    GuardError::InvalidKeyFormat("EC key missing 'x' coordinate".to_string())
                })?;
                let y = jwk.y.as_deref().ok_or_else(|| {
                    GuardError::InvalidKeyFormat("EC key missing 'y' coordinate".to_string())
                })?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|e| GuardError::InvalidKeyFormat(e.to_string()))?
            }
            other => {
                return Err(GuardError::InvalidKeyFormat(format!(
                    "unsupported key type '{}'",
                    other
                )))
            }
        };

        let algorithm = match jwk.alg.as_deref() {
            Some(alg) => Some(Algorithm::from_str(alg).map_err(|_| {
                GuardError::InvalidKeyFormat(format!("unsupported key algorithm '{}'", alg))
            })?),
            None => None,
        };

        Ok(Self {
            kid: jwk.kid.clone(),
            x5t: jwk.x5t.clone(),
            algorithm,
            decoding_key,
        })
    }
}

/// An immutable snapshot of the identity provider's metadata.
///
/// A refresh builds a new snapshot and swaps it in whole; a snapshot is never
/// modified after construction.
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub jwks_uri: String,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub end_session_endpoint: Option<String>,
    pub signing_keys: Vec<SigningKey>,
    pub fetched_at: DateTime<Utc>,
}

impl DiscoveryDocument {
    /// Builds a snapshot from the wire documents, skipping keys that cannot be used.
    pub fn from_parts(
        discovery: OidcDiscoveryDocument,
        jwks: JsonWebKeySet,
        fetched_at: DateTime<Utc>,
    ) -> Result<Self, GuardError> {
        let mut signing_keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            match SigningKey::from_jwk(jwk) {
                Ok(key) => signing_keys.push(key),
                Err(e) => debug!("Skipping JWK {:?}: {}", jwk.kid, e),
            }
        }

        if signing_keys.is_empty() {
            return Err(GuardError::InvalidDocument(format!(
                "key set at {} contains no usable signing keys",
                discovery.jwks_uri
            )));
        }

        Ok(Self {
            issuer: discovery.issuer,
            jwks_uri: discovery.jwks_uri,
            authorization_endpoint: discovery.authorization_endpoint,
            token_endpoint: discovery.token_endpoint,
            end_session_endpoint: discovery.end_session_endpoint,
            signing_keys,
            fetched_at,
        })
    }

    /// Finds the key a token names, by `kid` or, failing that, by `x5t`.
    pub fn find_key(&self, kid: Option<&str>, x5t: Option<&str>) -> Option<&SigningKey> {
        if let Some(kid) = kid {
            return self.signing_keys.iter().find(|k| k.kid.as_deref() == Some(kid));
        }
        let x5t = x5t?;
        self.signing_keys.iter().find(|k| k.x5t.as_deref() == Some(x5t))
    }

    /// Whether this document's issuer describes the token issuer `token_issuer`.
    ///
    /// Multi-tenant documents publish an issuer template such as
    /// `https://login.microsoftonline.com/{tenantid}/v2.0`; the configured tenant
    /// is substituted first. A trailing `/v2.0` version segment is ignored on
    /// both sides.
    pub fn issuer_covers(&self, token_issuer: &str, tenant_id: Option<&str>) -> bool {
        let published = match tenant_id {
            Some(tenant) => self.issuer.replace("{tenantid}", tenant),
            None if self.issuer.contains("{tenantid}") => return false,
            None => self.issuer.clone(),
        };
        versionless(&published) == versionless(token_issuer)
    }
}

/// Strips a trailing `/` and `/v2.0` from an issuer.
fn versionless(issuer: &str) -> &str {
    let issuer = issuer.trim_end_matches('/');
    issuer
        .strip_suffix("/v2.0")
        .unwrap_or(issuer)
        .trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_jwk(kid: &str) -> serde_json::Value {
        serde_json::json!({
            "kty": "RSA",
            "kid": kid,
            "use": "sig",
            "alg": "RS256",
            "x5t": format!("{kid}-thumb"),
            "n": "qcOdgRcX3CvZXVmaRiMUFyjJ5RsqZJS3xDfHwWvkfQqr6112xRearmnwpwcC657bKvEL644UF5CB-AZJpfLrvmfhATsSQkwYvv8teAqYtTY8SembUxko25NsozWBAvEcywY42t9Bsa4Siyv7coDCJxTaghzDYezR76qe-oNw_z2IHgosCTzxaXhbcLayXJMdWxIg3Go29EX13kiTMWVL3ojTCkB6HS9p4OauFK1B7BaXNCKKV_MpFj6SMOf_MEeoKLpSDNVJpDBfSKfIhjSFVDMBj__iphIBm1LsE5V2Yt9qBeuHRU7D480SlLk9rgvqnu_prnN4D5Ei8Jw_3zJJlw",
            "e": "AQAB"
        })
    }

    fn document(issuer: &str, keys: Vec<serde_json::Value>) -> Result<DiscoveryDocument, GuardError> {
        let discovery: OidcDiscoveryDocument = serde_json::from_value(serde_json::json!({
            "issuer": issuer,
            "jwks_uri": "https://login.example/keys",
            "token_endpoint": "https://login.example/token"
        }))
        .unwrap();
        let jwks: JsonWebKeySet = serde_json::from_value(serde_json::json!({ "keys": keys })).unwrap();
        DiscoveryDocument::from_parts(discovery, jwks, Utc::now())
    }

    #[test]
    fn unusable_keys_are_skipped() {
        let doc = document(
            "https://login.example/tenant/v2.0",
            vec![
                serde_json::json!({ "kty": "oct", "kid": "sym", "k": "c2VjcmV0" }),
                serde_json::json!({ "kty": "RSA", "kid": "enc", "use": "enc", "n": "AQAB", "e": "AQAB" }),
                rsa_jwk("good"),
            ],
        )
        .unwrap();
        assert_eq!(doc.signing_keys.len(), 1);
        assert_eq!(doc.signing_keys[0].kid.as_deref(), Some("good"));
        assert_eq!(doc.signing_keys[0].algorithm, Some(Algorithm::RS256));
    }

    #[test]
    fn empty_key_set_is_rejected() {
        let result = document("https://login.example/tenant/v2.0", vec![]);
        assert!(matches!(result, Err(GuardError::InvalidDocument(_))));
    }

    #[test]
    fn key_lookup_prefers_kid_then_x5t() {
        let doc = document("https://login.example/t", vec![rsa_jwk("a"), rsa_jwk("b")]).unwrap();
        assert_eq!(doc.find_key(Some("b"), None).and_then(|k| k.kid.as_deref()), Some("b"));
        assert!(doc.find_key(Some("missing"), Some("a-thumb")).is_none());
        assert_eq!(doc.find_key(None, Some("a-thumb")).and_then(|k| k.kid.as_deref()), Some("a"));
        assert!(doc.find_key(None, None).is_none());
    }

    #[test]
    fn tenant_template_issuer() {
        let doc = document("https://login.example/{tenantid}/v2.0", vec![rsa_jwk("a")]).unwrap();
        assert!(doc.issuer_covers("https://login.example/contoso/v2.0", Some("contoso")));
        assert!(!doc.issuer_covers("https://login.example/fabrikam/v2.0", Some("contoso")));
        assert!(!doc.issuer_covers("https://login.example/contoso/v2.0", None));

        // Versioned templates also describe the unversioned issuer.
        assert!(doc.issuer_covers("https://login.example/contoso", Some("contoso")));
        assert!(doc.issuer_covers("https://login.example/contoso/", Some("contoso")));
        assert!(!doc.issuer_covers("https://login.example/contoso/v1.0", Some("contoso")));

        let fixed = document("https://login.example/contoso", vec![rsa_jwk("a")]).unwrap();
        assert!(fixed.issuer_covers("https://login.example/contoso/v2.0", None));
        assert!(fixed.issuer_covers("https://login.example/contoso", None));
        assert!(!fixed.issuer_covers("https://login.example/other", Some("other")));
    }
}
