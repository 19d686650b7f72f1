//! # Memory Cache Store
//!
//! A concurrent map standing in for the owning cache's local memory.
//!
//! Invalidations evict entries created before the invalidation was issued.
//! External misses are counted per key; they do not change local contents.

use crate::domain::{CacheKey, CacheMissDescriptor, CachedValue, InvalidationDescriptor};
use crate::ports::LocalCacheStore;
use dashmap::DashMap;
use tracing::debug;

/// In-memory local cache.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: DashMap<CacheKey, CachedValue>,
    external_misses: DashMap<CacheKey, u64>,
}

impl MemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value.
    pub fn insert(&self, key: impl Into<CacheKey>, value: CachedValue) {
        self.entries.insert(key.into(), value);
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Misses peers reported for a key.
    pub fn external_misses(&self, key: &CacheKey) -> u64 {
        self.external_misses.get(key).map_or(0, |count| *count)
    }
}

impl LocalCacheStore for MemoryCacheStore {
    fn try_get_local_value(&self, key: &CacheKey) -> Option<CachedValue> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn apply_external_miss(&self, descriptor: &CacheMissDescriptor) {
        *self
            .external_misses
            .entry(descriptor.key.clone())
            .or_insert(0) += 1;
    }

    fn apply_invalidation(&self, descriptor: &InvalidationDescriptor) {
        let removed = self
            .entries
            .remove_if(&descriptor.key, |_, value| {
                value.created_at_ms <= descriptor.issued_at_ms
            })
            .is_some();
        debug!(
            key = %descriptor.key,
            origin = %descriptor.origin,
            removed,
            "Applied invalidation"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_clone() {
        let store = MemoryCacheStore::new();
        store.insert("k1", CachedValue::new("i32", serde_json::json!(42)));

        let value = store.try_get_local_value(&"k1".into()).unwrap();
        assert_eq!(value.payload, serde_json::json!(42));
        assert!(store.try_get_local_value(&"k2".into()).is_none());
    }

    #[test]
    fn test_invalidation_evicts_older_entries_only() {
        let store = MemoryCacheStore::new();
        store.insert("old", CachedValue::new("i32", serde_json::json!(1)).with_created_at(100));
        store.insert("new", CachedValue::new("i32", serde_json::json!(2)).with_created_at(300));

        for key in ["old", "new"] {
            store.apply_invalidation(&InvalidationDescriptor {
                key: key.into(),
                origin: "node-b".into(),
                issued_at_ms: 200,
            });
        }

        assert!(!store.contains(&"old".into()));
        assert!(store.contains(&"new".into()));
    }

    #[test]
    fn test_external_misses_counted() {
        let store = MemoryCacheStore::new();
        let miss = CacheMissDescriptor::new("k1", "node-b");
        store.apply_external_miss(&miss);
        store.apply_external_miss(&miss);

        assert_eq!(store.external_misses(&"k1".into()), 2);
        assert_eq!(store.external_misses(&"k2".into()), 0);
        assert!(store.is_empty());
    }
}
