//! # Pending Response Registry
//!
//! Maps correlation ids to the reassembler collecting that response.
//!
//! Flow:
//! 1. Requester picks a correlation id and sends a get-request
//! 2. Requester calls `get()`, which creates the entry if needed and waits
//! 3. The receive loop calls `set()` for each response chunk; this also
//!    creates the entry, so chunks arriving before the requester waits are kept
//! 4. The periodic sweep drops entries older than the maximum age, complete or not

use crate::chunking::{ChunkError, ChunkReassembler};
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct PendingEntry {
    reassembler: Arc<ChunkReassembler>,
    created_at: Instant,
}

/// Registry of in-flight peer requests.
#[derive(Default)]
pub struct PendingResponseRegistry {
    entries: DashMap<String, PendingEntry>,
}

impl PendingResponseRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn reassembler(&self, correlation_id: &str) -> Arc<ChunkReassembler> {
        let entry = self
            .entries
            .entry(correlation_id.to_string())
            .or_insert_with(|| PendingEntry {
                reassembler: Arc::new(ChunkReassembler::new()),
                created_at: Instant::now(),
            });
        Arc::clone(&entry.reassembler)
    }

    /// Wait for the complete response, or `None` once `cancel` resolves.
    pub async fn get<C>(&self, correlation_id: &str, cancel: C) -> Option<Bytes>
    where
        C: Future<Output = ()>,
    {
        let reassembler = self.reassembler(correlation_id);
        reassembler.get(cancel).await
    }

    /// Store one response chunk.
    pub fn set(
        &self,
        correlation_id: &str,
        chunk_index: usize,
        chunk_count: usize,
        bytes: Bytes,
    ) -> Result<bool, ChunkError> {
        self.reassembler(correlation_id)
            .set(chunk_index, chunk_count, bytes)
    }

    /// Forget a correlation id.
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.entries.remove(correlation_id).is_some()
    }

    /// Drop entries at least `max_age` old. Returns the number removed.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|correlation_id, entry| {
            let age = now.duration_since(entry.created_at);
            if age >= max_age {
                debug!(
                    correlation_id = %correlation_id,
                    age_ms = age.as_millis() as u64,
                    complete = entry.reassembler.is_ready(),
                    "Sweeping pending response"
                );
                removed += 1;
                false
            } else {
                true
            }
        });

        removed
    }

    /// Number of tracked correlation ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a correlation id is tracked.
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Run `sweep(max_age)` every `period` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Pending response sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = registry.sweep(max_age);
                        if removed > 0 {
                            debug!(removed, "Swept stale pending responses");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_before_get() {
        let registry = PendingResponseRegistry::new();
        assert!(registry.set("c-1", 1, 1, Bytes::from_static(b"42")).unwrap());
        assert!(registry.contains("c-1"));

        let value = registry.get("c-1", std::future::pending()).await;
        assert_eq!(value.unwrap(), Bytes::from_static(b"42"));
    }

    #[tokio::test]
    async fn test_get_before_set() {
        let registry = Arc::new(PendingResponseRegistry::new());
        let reader = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.get("c-1", std::future::pending()).await })
        };
        tokio::task::yield_now().await;

        registry.set("c-1", 2, 2, Bytes::from_static(b"b")).unwrap();
        registry.set("c-1", 1, 2, Bytes::from_static(b"a")).unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_cancelled_returns_none() {
        let registry = PendingResponseRegistry::new();
        let value = registry
            .get("c-1", tokio::time::sleep(Duration::from_secs(1)))
            .await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_set_error_propagates() {
        let registry = PendingResponseRegistry::new();
        assert_eq!(
            registry.set("c-1", 0, 1, Bytes::new()),
            Err(ChunkError::InvalidIndex { index: 0, count: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_by_age() {
        let registry = PendingResponseRegistry::new();
        registry.set("old", 1, 2, Bytes::new()).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        registry.set("young", 1, 1, Bytes::new()).unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.sweep(Duration::from_secs(60)), 1);
        assert!(!registry.contains("old"));
        assert!(registry.contains("young"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_until_cancelled() {
        let registry = Arc::new(PendingResponseRegistry::new());
        let cancel = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(
            Duration::from_secs(60),
            Duration::from_secs(60),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        registry.set("c-1", 1, 1, Bytes::new()).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.contains("c-1"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[test]
    fn test_remove() {
        let registry = PendingResponseRegistry::new();
        registry.set("c-1", 1, 1, Bytes::new()).unwrap();
        assert!(registry.remove("c-1"));
        assert!(!registry.remove("c-1"));
    }
}
