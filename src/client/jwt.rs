//! JWT decoding utilities.
//!
//! Splits a compact JWT, base64url-decodes the header and payload, and exposes
//! the payload as a loosely-typed claim map. No signature checking happens
//! here; see `client::validation` for that.

use crate::error::ValidationError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JOSE header fields used for key selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwtHeader {
    /// Signing algorithm (e.g. "RS256")
    #[serde(default)]
    pub alg: Option<String>,

    /// Key ID used to pick the verification key from the JWKS
    #[serde(default)]
    pub kid: Option<String>,

    /// Token type (usually "JWT")
    #[serde(default)]
    pub typ: Option<String>,
}

/// The `aud` claim, which may be a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    Single(String),
    Multiple(Vec<String>),
}

impl Audience {
    /// Returns true if `expected` equals the audience or is one of its entries.
    pub fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::Single(aud) => aud == expected,
            Audience::Multiple(list) => list.iter().any(|aud| aud == expected),
        }
    }
}

/// Decoded JWT payload.
///
/// Well-known claims have typed accessors; everything else is reachable
/// through `get`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// Returns a claim by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the whole claim map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Subject claim.
    pub fn sub(&self) -> Option<&str> {
        self.0.get("sub").and_then(Value::as_str)
    }

    /// Issuer claim.
    pub fn iss(&self) -> Option<&str> {
        self.0.get("iss").and_then(Value::as_str)
    }

    /// Expiration time in seconds since the Unix epoch.
    ///
    /// Fractional values are truncated; non-numeric values read as absent.
    pub fn exp(&self) -> Option<i64> {
        let value = self.0.get("exp")?;
        value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
    }

    /// Issued-at time in seconds since the Unix epoch.
    pub fn iat(&self) -> Option<i64> {
        self.0.get("iat").and_then(Value::as_i64)
    }

    /// Audience claim.
    pub fn aud(&self) -> Option<Audience> {
        self.0
            .get("aud")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

impl From<Map<String, Value>> for Claims {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A JWT split into its decoded header and claims.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedJwt {
    pub header: JwtHeader,
    pub claims: Claims,
}

/// Decodes a compact JWT without verifying its signature.
///
/// # Errors
///
/// Returns `ValidationError::MalformedToken` if the token does not have three
/// dot-separated segments, a segment is not base64url, or the header/payload
/// is not a JSON object.
pub fn decode(token: &str) -> Result<DecodedJwt, ValidationError> {
    let parts: Vec<&str> = token.split('.').collect();

    if parts.len() != 3 {
        tracing::warn!("Invalid JWT format: expected 3 parts, got {}", parts.len());
        return Err(ValidationError::MalformedToken(format!(
            "expected 3 segments, got {}",
            parts.len()
        )));
    }

    let header: JwtHeader = decode_segment(parts[0], "header")?;
    let claims: Map<String, Value> = decode_segment(parts[1], "payload")?;

    Ok(DecodedJwt {
        header,
        claims: Claims(claims),
    })
}

/// Decodes only the payload of a JWT.
pub fn decode_claims(token: &str) -> Result<Claims, ValidationError> {
    decode(token).map(|jwt| jwt.claims)
}

fn decode_segment<T: serde::de::DeserializeOwned>(
    segment: &str,
    what: &str,
) -> Result<T, ValidationError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|e| ValidationError::MalformedToken(format!("{} is not base64url: {}", what, e)))?;

    serde_json::from_slice(&bytes)
        .map_err(|e| ValidationError::MalformedToken(format!("{} is not a JSON object: {}", what, e)))
}
