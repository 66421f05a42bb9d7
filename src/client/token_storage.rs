//! Durable token persistence.
//!
//! The engine keeps the current `TokenRecord` in memory and uses `TokenStore`
//! only as the durability layer: the record is written after every successful
//! login or refresh and read back once on cold start.
//!
//! ## Storage strategy
//!
//! - The record is serialized as one JSON object under one key, so a write is
//!   a single `set` call and a concurrent `load` never sees half a record
//! - `clear` removes the key and is safe to call when nothing is stored
//! - Failures are returned to the caller; the engine treats them as a reason
//!   to fall back to the unauthenticated state, never as a crash
//!
//! The backing substrate is any `KeyValueStore`: `localStorage`,
//! `sessionStorage` or cookies in the browser (see `client::browser`), or the
//! in-process `MemoryStore`.

use crate::client::jwt;
use crate::client::runtime::{MaybeSend, now_millis};
use crate::error::StorageError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Minimal synchronous key/value contract shared by every storage backend.
pub trait KeyValueStore: MaybeSend {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process store. Clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// The persisted token set.
///
/// `expires_at` is an absolute Unix time in milliseconds. When it is absent
/// the access token's lifetime is not tracked locally and has to be read from
/// its `exp` claim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            id_token: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(id_token.into());
        self
    }

    /// Sets the absolute expiry (Unix milliseconds).
    pub fn with_expires_at(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets the expiry relative to `now` (Unix milliseconds).
    pub fn expiring_in(self, expires_in_secs: u64, now: i64) -> Self {
        self.with_expires_at(now.saturating_add((expires_in_secs as i64).saturating_mul(1000)))
    }

    /// Returns true if the locally tracked expiry has passed.
    ///
    /// Records without `expires_at` are never locally expired.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Like `is_expired_at`, but falls back to the access token's `exp`
    /// claim when `expires_at` is absent. Opaque tokens without a local
    /// expiry are treated as live.
    pub fn is_expired_by_claims_at(&self, now: i64) -> bool {
        if self.expires_at.is_some() {
            return self.is_expired_at(now);
        }
        jwt::decode_claims(&self.access_token)
            .ok()
            .and_then(|claims| claims.exp())
            .is_some_and(|exp| now / 1000 >= exp)
    }

    /// Milliseconds until expiry, or `None` when not tracked.
    pub fn remaining_millis(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|expires_at| expires_at - now)
    }
}

/// Reads and writes the `TokenRecord` under a single key.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
    key: String,
}

impl TokenStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Loads the stored record.
    ///
    /// Returns `Ok(None)` when nothing is stored and
    /// `StorageError::Serialization` when the stored value is not a record.
    pub fn load(&self) -> Result<Option<TokenRecord>, StorageError> {
        let Some(raw) = self.backend.get(&self.key)? else {
            tracing::trace!("No token record under '{}'", self.key);
            return Ok(None);
        };

        serde_json::from_str(&raw).map(Some).map_err(|e| {
            tracing::warn!("Stored token record is corrupt: {}", e);
            StorageError::Serialization(e.to_string())
        })
    }

    /// Persists the record, replacing any previous one.
    pub fn save(&self, record: &TokenRecord) -> Result<(), StorageError> {
        let raw = serde_json::to_string(record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.backend.set(&self.key, &raw)?;
        tracing::trace!("Token record saved under '{}'", self.key);
        Ok(())
    }

    /// Removes the stored record. Idempotent.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.backend.remove(&self.key)?;
        tracing::trace!("Token record cleared from '{}'", self.key);
        Ok(())
    }
}
