//! # Cache Companion
//!
//! Wires one node's components together and owns their lifecycle.
//!
//! ```text
//! start():    validate → install → spawn receive loop + sweeper
//! shutdown(): cancel → await stop latch → uninstall → close connection
//! ```

use crate::broadcaster::EventBroadcaster;
use crate::config::CompanionConfig;
use crate::connection::{BusConnectionHolder, ConnectionState};
use crate::error::CompanionError;
use crate::peer::PeerCacheLocation;
use crate::pending::PendingResponseRegistry;
use crate::ports::{LocalCacheStore, ValueSerializer};
use crate::processor::MessageProcessor;
use crate::receive_loop::{ReceiveLoop, ReceiveLoopHandle};
use crate::stats::{CompanionStats, StatsSnapshot};
use crate::topology::TopologyInstaller;
use parking_lot::Mutex;
use shared_bus::BusConnector;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A running bus companion for one cache node.
pub struct CacheCompanion {
    config: Arc<CompanionConfig>,
    holder: Arc<BusConnectionHolder>,
    registry: Arc<PendingResponseRegistry>,
    installer: Arc<TopologyInstaller>,
    serializer: Arc<dyn ValueSerializer>,
    stats: Arc<CompanionStats>,
    cancel: CancellationToken,
    receive_loop: Mutex<Option<ReceiveLoopHandle>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl CacheCompanion {
    /// Validate `config`, install the topology and start listening.
    ///
    /// Fails if the configuration is invalid or the first install hits a
    /// permanent fault or runs out of retries.
    pub async fn start(
        config: CompanionConfig,
        connector: Arc<dyn BusConnector>,
        store: Arc<dyn LocalCacheStore>,
        serializer: Arc<dyn ValueSerializer>,
    ) -> Result<Self, CompanionError> {
        config.validate()?;
        let config = Arc::new(config);

        let holder = Arc::new(BusConnectionHolder::new());
        let registry = Arc::new(PendingResponseRegistry::new());
        let stats = Arc::new(CompanionStats::default());
        let installer = Arc::new(TopologyInstaller::new(
            Arc::clone(&config),
            connector,
            Arc::clone(&holder),
        ));

        let conn = installer.install().await?;

        let cancel = CancellationToken::new();
        let sweeper = registry.spawn_sweeper(
            config.sweep_interval(),
            config.sweep_interval(),
            cancel.clone(),
        );

        let processor = Arc::new(MessageProcessor::new(
            &config,
            Arc::clone(&holder),
            Arc::clone(&registry),
            store,
            Arc::clone(&serializer),
            Arc::clone(&stats),
        ));
        let receive_loop = ReceiveLoop::new(
            Arc::clone(&config),
            Arc::clone(&installer),
            Arc::clone(&holder),
            processor,
            Arc::clone(&stats),
            cancel.clone(),
        )
        .spawn(Some(conn));

        info!(
            node_id = %config.node_id,
            topic = %config.topic_name,
            "Cache companion started"
        );

        Ok(Self {
            config,
            holder,
            registry,
            installer,
            serializer,
            stats,
            cancel,
            receive_loop: Mutex::new(Some(receive_loop)),
            sweeper: Mutex::new(Some(sweeper)),
            shut_down: AtomicBool::new(false),
        })
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// The configuration in use.
    pub fn config(&self) -> &CompanionConfig {
        &self.config
    }

    /// A handle for asking `peer_id` for values.
    pub fn peer(&self, peer_id: impl Into<String>) -> PeerCacheLocation {
        PeerCacheLocation::new(
            self.config.node_id.clone(),
            peer_id.into(),
            self.config.request_timeout(),
            Arc::clone(&self.holder),
            Arc::clone(&self.registry),
            Arc::clone(&self.serializer),
            Arc::clone(&self.stats),
        )
    }

    /// A handle for broadcasting cache events.
    pub fn broadcaster(&self) -> EventBroadcaster {
        EventBroadcaster::new(
            self.config.node_id.clone(),
            self.config.request_timeout(),
            Arc::clone(&self.holder),
        )
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.holder.state()
    }

    /// In-flight peer requests.
    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Stop listening, remove this node's subscription and close the
    /// connection. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node_id = %self.config.node_id, "Cache companion shutting down");
        self.cancel.cancel();

        let receive_loop = self.receive_loop.lock().take();
        if let Some(handle) = receive_loop {
            // The latch fires after every in-flight message task has finished.
            let _ = handle.stopped.await;
            if let Err(err) = handle.task.await {
                warn!(error = %err, "Receive loop task failed");
            }
        }

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(err) = sweeper.await {
                warn!(error = %err, "Sweeper task failed");
            }
        }

        self.installer.uninstall().await;
        self.holder.close().await;
        info!(node_id = %self.config.node_id, "Cache companion stopped");
    }
}

impl Drop for CacheCompanion {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{JsonValueSerializer, MemoryCacheStore};
    use crate::error::ConfigError;
    use shared_bus::InMemoryMessageBus;

    async fn start(
        bus: &InMemoryMessageBus,
        config: CompanionConfig,
    ) -> Result<CacheCompanion, CompanionError> {
        CacheCompanion::start(
            config,
            Arc::new(bus.clone()),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(JsonValueSerializer),
        )
        .await
    }

    #[tokio::test]
    async fn test_invalid_config_never_connects() {
        let bus = InMemoryMessageBus::new();
        let mut config = CompanionConfig::for_testing("node-a");
        config.request_timeout_ms = 10;

        let result = start(&bus, config).await;
        assert!(matches!(
            result,
            Err(CompanionError::Config(ConfigError::RequestTimeoutTooShort { .. }))
        ));
        assert_eq!(bus.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let bus = InMemoryMessageBus::new();
        let companion = start(&bus, CompanionConfig::for_testing("node-a")).await.unwrap();
        assert_eq!(companion.node_id(), "node-a");
        assert!(companion.connection_state().is_connected());
        assert_eq!(bus.subscription_names("cache-sync"), vec!["node-a"]);

        companion.shutdown().await;
        assert_eq!(companion.connection_state().label(), "closed");
        assert!(bus.subscription_names("cache-sync").is_empty());

        companion.shutdown().await;
    }

    #[tokio::test]
    async fn test_broadcast_after_shutdown_fails() {
        let bus = InMemoryMessageBus::new();
        let companion = start(&bus, CompanionConfig::for_testing("node-a")).await.unwrap();
        let broadcaster = companion.broadcaster();
        companion.shutdown().await;

        let result = broadcaster
            .notify_cache_miss(&crate::domain::CacheMissDescriptor::new("k1", "node-a"))
            .await;
        assert!(matches!(result, Err(CompanionError::Stopped)));
    }
}
