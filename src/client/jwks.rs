//! JWKS (JSON Web Key Set) caching for JWT signature verification.
//!
//! Keys are fetched from the configured JWKS endpoint, indexed by `kid` and
//! trusted for a TTL. A token signed with a `kid` the cache has not seen
//! triggers one forced refetch, which picks up key rotation without waiting
//! for the TTL. Forced refetches are at most one per cooldown period, so a
//! stream of tokens with unknown `kid`s costs one request per period.

use crate::client::http_client::{HttpRequest, HttpTransport};
use crate::client::runtime::now_millis;
use crate::error::{AuthError, ValidationError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Minimum time between two fetches triggered by an unknown `kid`.
pub const DEFAULT_REFETCH_COOLDOWN: Duration = Duration::from_secs(30);

/// A JSON Web Key from the JWKS endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA", "EC")
    pub kty: String,

    /// Key ID - used to match keys in JWT header
    #[serde(default)]
    pub kid: Option<String>,

    /// Algorithm (e.g., "RS256")
    #[serde(default)]
    pub alg: Option<String>,

    /// Public key usage (e.g., "sig" for signature)
    #[serde(rename = "use", default)]
    pub key_use: Option<String>,

    /// RSA modulus (base64url encoded)
    #[serde(default)]
    pub n: Option<String>,

    /// RSA exponent (base64url encoded)
    #[serde(default)]
    pub e: Option<String>,

    /// EC curve name
    #[serde(default)]
    pub crv: Option<String>,

    /// EC x coordinate (base64url encoded)
    #[serde(default)]
    pub x: Option<String>,

    /// EC y coordinate (base64url encoded)
    #[serde(default)]
    pub y: Option<String>,

    /// X.509 certificate chain
    #[serde(default)]
    pub x5c: Option<Vec<String>>,
}

/// Response from the JWKS endpoint.
#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Default)]
struct CacheState {
    keys: HashMap<String, Jwk>,
    fetched_at: Option<i64>,
}

/// Cache for JWKS keys with TTL-based refresh.
pub struct JwksCache {
    url: String,
    transport: Arc<dyn HttpTransport>,
    ttl: Duration,
    refetch_cooldown: Duration,
    state: Mutex<CacheState>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>, transport: Arc<dyn HttpTransport>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            transport,
            ttl,
            refetch_cooldown: DEFAULT_REFETCH_COOLDOWN,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_refetch_cooldown(mut self, cooldown: Duration) -> Self {
        self.refetch_cooldown = cooldown;
        self
    }

    /// Gets the key for `kid`, fetching the key set if necessary.
    ///
    /// A token without a `kid` cannot be matched and is rejected with
    /// `UnknownSigningKey(None)`.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<Jwk, AuthError> {
        let Some(kid) = kid else {
            tracing::warn!("JWT header carries no kid");
            return Err(ValidationError::UnknownSigningKey(None).into());
        };

        if self.should_refresh() {
            tracing::trace!("JWKS cache expired or empty, refreshing...");
            self.fetch_jwks().await?;
        }

        if let Some(key) = self.cached(kid) {
            tracing::trace!("Found key with kid '{}' in cache", kid);
            return Ok(key);
        }

        if self.fetched_within(self.refetch_cooldown) {
            tracing::warn!("No signing key for kid '{}' and key set is fresh", kid);
            return Err(ValidationError::UnknownSigningKey(Some(kid.to_string())).into());
        }

        tracing::trace!("Key with kid '{}' not in cache, forcing refresh", kid);
        self.fetch_jwks().await?;

        self.cached(kid).ok_or_else(|| {
            tracing::warn!("No signing key found for kid '{}'", kid);
            ValidationError::UnknownSigningKey(Some(kid.to_string())).into()
        })
    }

    fn fetched_within(&self, period: Duration) -> bool {
        self.state
            .lock()
            .fetched_at
            .is_some_and(|at| now_millis() - at < period.as_millis() as i64)
    }

    fn cached(&self, kid: &str) -> Option<Jwk> {
        self.state.lock().keys.get(kid).cloned()
    }

    fn should_refresh(&self) -> bool {
        match self.state.lock().fetched_at {
            None => true,
            Some(at) => now_millis() - at >= self.ttl.as_millis() as i64,
        }
    }

    /// Fetches the key set and replaces the cache contents.
    pub async fn fetch_jwks(&self) -> Result<(), AuthError> {
        tracing::trace!("Fetching JWKS from: {}", self.url);

        let response = self.transport.execute(HttpRequest::get(&self.url)).await?;
        if !response.is_success() {
            tracing::error!("Failed to fetch JWKS: HTTP {}", response.status);
            return Err(AuthError::Network(format!(
                "JWKS endpoint returned {}",
                response.status
            )));
        }

        let jwks: JwksResponse = response.json().map_err(|e| {
            tracing::error!("Failed to parse JWKS: {}", e);
            AuthError::Network(format!("invalid JWKS document: {}", e))
        })?;
        tracing::trace!("Fetched {} keys from JWKS", jwks.keys.len());

        let keys = jwks
            .keys
            .into_iter()
            .filter_map(|key| key.kid.clone().map(|kid| (kid, key)))
            .collect();

        let mut state = self.state.lock();
        state.keys = keys;
        state.fetched_at = Some(now_millis());
        Ok(())
    }

    /// Returns the number of keys currently in the cache.
    pub fn key_count(&self) -> usize {
        self.state.lock().keys.len()
    }
}
