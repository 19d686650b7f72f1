//! # Cache Types
//!
//! Keys, values and the descriptors exchanged between nodes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Key of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Borrow the key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// A value as held by a node's local cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    /// Name of the value's type, used by the owning cache to rehydrate it.
    pub type_hint: String,
    /// When the value was produced (Unix ms).
    pub created_at_ms: u64,
    /// The value itself.
    pub payload: serde_json::Value,
}

impl CachedValue {
    /// Create a value stamped with the current time.
    pub fn new(type_hint: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            type_hint: type_hint.into(),
            created_at_ms: now_ms(),
            payload,
        }
    }

    /// Override the creation time.
    #[must_use]
    pub fn with_created_at(mut self, created_at_ms: u64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }

    /// Whether the value is at least as new as `min_created_at_ms`.
    pub fn is_fresh(&self, min_created_at_ms: Option<u64>) -> bool {
        min_created_at_ms.map_or(true, |min| self.created_at_ms >= min)
    }
}

/// Body of a get-request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetRequest {
    /// Requested key.
    pub key: CacheKey,
    /// Oldest acceptable creation time; older values are not sent.
    pub min_created_at_ms: Option<u64>,
}

/// A node missed a key and is loading it from the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMissDescriptor {
    /// Missed key.
    pub key: CacheKey,
    /// Node that missed.
    pub origin: String,
    /// When the miss happened (Unix ms).
    pub occurred_at_ms: u64,
}

impl CacheMissDescriptor {
    /// Describe a miss happening now.
    pub fn new(key: impl Into<CacheKey>, origin: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin: origin.into(),
            occurred_at_ms: now_ms(),
        }
    }
}

/// A key was changed at its source; copies created before `issued_at_ms` are stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationDescriptor {
    /// Invalidated key.
    pub key: CacheKey,
    /// Node that issued the invalidation.
    pub origin: String,
    /// When the invalidation was issued (Unix ms).
    pub issued_at_ms: u64,
}

impl InvalidationDescriptor {
    /// Describe an invalidation issued now.
    pub fn new(key: impl Into<CacheKey>, origin: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin: origin.into(),
            issued_at_ms: now_ms(),
        }
    }
}
