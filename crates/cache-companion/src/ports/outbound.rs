//! # Outbound Ports
//!
//! What the companion needs from the cache it serves: direct access to the
//! local store and a value codec.

use crate::domain::{CacheKey, CacheMissDescriptor, CachedValue, InvalidationDescriptor};
use crate::error::CompanionError;

/// The node's local cache, consulted when answering peers.
pub trait LocalCacheStore: Send + Sync {
    /// Read a value straight from local memory, without any remote fallback.
    fn try_get_local_value(&self, key: &CacheKey) -> Option<CachedValue>;

    /// A peer reported a miss for a key.
    fn apply_external_miss(&self, descriptor: &CacheMissDescriptor);

    /// A peer reported that a key changed at its source.
    fn apply_invalidation(&self, descriptor: &InvalidationDescriptor);
}

/// Turns cached values into bytes and back.
pub trait ValueSerializer: Send + Sync {
    /// Encode a value.
    fn serialize(&self, value: &CachedValue) -> Result<Vec<u8>, CompanionError>;

    /// Decode a value.
    fn deserialize(&self, bytes: &[u8]) -> Result<CachedValue, CompanionError>;
}
