// src/validator/token.rs

use super::result::ValidationFailure;
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

/// The long-form role claim type some issuers emit next to `roles`.
pub const ROLE_CLAIM_URI: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims/role";

/// Claims that carry role values, in the order they are collected.
const ROLE_CLAIMS: [&str; 3] = ["roles", "role", ROLE_CLAIM_URI];

/// The JOSE header fields the validator looks at.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub x5t: Option<String>,
}

/// A structurally valid but not yet verified token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    pub header: TokenHeader,
    pub claims: Map<String, Value>,
    pub issuer: Option<String>,
    pub audiences: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub not_before: Option<DateTime<Utc>>,
    pub roles: Vec<String>,
    /// Decoded signature bytes, exposed for callers inspecting the token.
    /// Verification works on the encoded segment.
    pub signature: Vec<u8>,
    /// `header.payload`, the bytes covered by the signature.
    pub signed_content: String,
    pub(crate) encoded_signature: String,
}

fn decode_segment(name: &str, segment: &str) -> Result<Vec<u8>, ValidationFailure> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| ValidationFailure::malformed(format!("Token {name} is not base64url: {e}")))
}

fn numeric_date(claims: &Map<String, Value>, name: &str) -> Result<Option<DateTime<Utc>>, ValidationFailure> {
    let Some(value) = claims.get(name) else {
        return Ok(None);
    };
    let seconds = value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| ValidationFailure::malformed(format!("Claim '{name}' is not a numeric date")))?;
    DateTime::from_timestamp(seconds, 0)
        .map(Some)
        .ok_or_else(|| ValidationFailure::malformed(format!("Claim '{name}' is out of range")))
}

/// Collects string values from a claim that may be a single string or an array.
fn string_values(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl ParsedToken {
    /// Splits and decodes a compact token without verifying anything.
    pub fn parse(token: &str) -> Result<Self, ValidationFailure> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(ValidationFailure::malformed(format!(
                "Token is not a valid JWT: expected 3 segments, found {}",
                segments.len()
            )));
        }
        let (header_segment, payload_segment, signature_segment) =
            (segments[0], segments[1], segments[2]);
        for (name, segment) in [
            ("header", header_segment),
            ("payload", payload_segment),
            ("signature", signature_segment),
        ] {
            if segment.is_empty() {
                return Err(ValidationFailure::malformed(format!(
                    "Token is not a valid JWT: {name} segment is empty"
                )));
            }
        }

        let header: TokenHeader = serde_json::from_slice(&decode_segment("header", header_segment)?)
            .map_err(|e| ValidationFailure::malformed(format!("Token header is not valid JSON: {e}")))?;
        let claims: Map<String, Value> =
            serde_json::from_slice(&decode_segment("payload", payload_segment)?).map_err(|e| {
                ValidationFailure::malformed(format!("Token payload is not a JSON object: {e}"))
            })?;
        let signature = decode_segment("signature", signature_segment)?;

        let issuer = match claims.get("iss") {
            None => None,
            Some(Value::String(iss)) => Some(iss.clone()),
            Some(_) => return Err(ValidationFailure::malformed("Claim 'iss' is not a string")),
        };

        let audiences = match claims.get("aud") {
            None => Vec::new(),
            Some(aud @ (Value::String(_) | Value::Array(_))) => string_values(aud),
            Some(_) => {
                return Err(ValidationFailure::malformed(
                    "Claim 'aud' is neither a string nor an array",
                ))
            }
        };

        let expires_at = numeric_date(&claims, "exp")?;
        let not_before = numeric_date(&claims, "nbf")?;

        let mut roles: Vec<String> = Vec::new();
        for claim in ROLE_CLAIMS {
            if let Some(value) = claims.get(claim) {
                for role in string_values(value) {
                    if !roles.contains(&role) {
                        roles.push(role);
                    }
                }
            }
        }

        Ok(Self {
            header,
            claims,
            issuer,
            audiences,
            expires_at,
            not_before,
            roles,
            signature,
            signed_content: format!("{header_segment}.{payload_segment}"),
            encoded_signature: signature_segment.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::FailureKind;

    fn segment(value: &Value) -> String {
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(value).unwrap())
    }

    fn token(header: Value, payload: Value) -> String {
        format!("{}.{}.{}", segment(&header), segment(&payload), URL_SAFE_NO_PAD.encode(b"sig"))
    }

    fn kind(result: Result<ParsedToken, ValidationFailure>) -> FailureKind {
        result.unwrap_err().kind
    }

    #[test]
    fn parses_claims_and_header() {
        let raw = token(
            serde_json::json!({ "alg": "RS256", "kid": "k1", "typ": "JWT" }),
            serde_json::json!({
                "iss": "https://login.example/t1",
                "aud": "api-client",
                "exp": 1_900_000_000,
                "nbf": 1_700_000_000.5,
                "sub": "user"
            }),
        );
        let parsed = ParsedToken::parse(&raw).unwrap();
        assert_eq!(parsed.header.alg, "RS256");
        assert_eq!(parsed.header.kid.as_deref(), Some("k1"));
        assert_eq!(parsed.issuer.as_deref(), Some("https://login.example/t1"));
        assert_eq!(parsed.audiences, vec!["api-client"]);
        assert_eq!(parsed.expires_at.unwrap().timestamp(), 1_900_000_000);
        assert_eq!(parsed.not_before.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(parsed.signature, b"sig");
        assert!(raw.starts_with(&parsed.signed_content));
        assert_eq!(parsed.claims["sub"], "user");
    }

    #[test]
    fn two_segments_are_malformed() {
        assert_eq!(kind(ParsedToken::parse("not.a")), FailureKind::MalformedToken);
        assert_eq!(kind(ParsedToken::parse("not.a.jwt.really")), FailureKind::MalformedToken);
        assert_eq!(kind(ParsedToken::parse("")), FailureKind::MalformedToken);
    }

    #[test]
    fn undecodable_segments_are_malformed() {
        // Three segments, but not base64url-encoded JSON.
        assert_eq!(kind(ParsedToken::parse("not.a.jwt")), FailureKind::MalformedToken);
        assert_eq!(kind(ParsedToken::parse("..")), FailureKind::MalformedToken);
        let payload_array = format!(
            "{}.{}.c2ln",
            segment(&serde_json::json!({ "alg": "RS256" })),
            segment(&serde_json::json!([1, 2]))
        );
        assert_eq!(kind(ParsedToken::parse(&payload_array)), FailureKind::MalformedToken);
    }

    #[test]
    fn mistyped_claims_are_malformed() {
        let header = serde_json::json!({ "alg": "RS256" });
        for payload in [
            serde_json::json!({ "exp": "tomorrow" }),
            serde_json::json!({ "iss": 42 }),
            serde_json::json!({ "aud": { "nested": true } }),
        ] {
            assert_eq!(
                kind(ParsedToken::parse(&token(header.clone(), payload))),
                FailureKind::MalformedToken
            );
        }
    }

    #[test]
    fn roles_are_collected_from_every_role_claim() {
        let raw = token(
            serde_json::json!({ "alg": "RS256" }),
            serde_json::json!({
                "roles": ["Reader", "Writer"],
                "role": "Admin",
                ROLE_CLAIM_URI: ["Reader", "Auditor"],
                "aud": ["a", "b"]
            }),
        );
        let parsed = ParsedToken::parse(&raw).unwrap();
        assert_eq!(parsed.roles, vec!["Reader", "Writer", "Admin", "Auditor"]);
        assert_eq!(parsed.audiences, vec!["a", "b"]);
        assert!(parsed.expires_at.is_none());
    }

    #[test]
    fn single_string_roles_claim() {
        let raw = token(
            serde_json::json!({ "alg": "RS256" }),
            serde_json::json!({ "roles": "Reader" }),
        );
        assert_eq!(ParsedToken::parse(&raw).unwrap().roles, vec!["Reader"]);
    }
}
