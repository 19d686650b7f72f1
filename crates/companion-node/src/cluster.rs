//! # Local Cluster
//!
//! Several cache nodes sharing one in-memory bus. Each node has its own
//! `MemoryCacheStore` and `CacheCompanion`.

use anyhow::{bail, Context, Result};
use cache_companion::{
    CacheCompanion, CacheKey, CachedValue, CompanionConfig, InvalidationDescriptor,
    JsonValueSerializer, MemoryCacheStore, PeerGetOutcome,
};
use chrono::Utc;
use shared_bus::InMemoryMessageBus;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cluster layout, read from `CACHE_COMPANION_CLUSTER_NODES` and
/// `CACHE_COMPANION_DEMO_INTERVAL_SECS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    /// Node ids, one companion each.
    pub node_ids: Vec<String>,
    /// Seconds between demo rounds.
    pub demo_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_ids: vec!["node-a".into(), "node-b".into(), "node-c".into()],
            demo_interval: Duration::from_secs(5),
        }
    }
}

impl ClusterConfig {
    /// Load from the environment, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup("CACHE_COMPANION_CLUSTER_NODES") {
            config.node_ids = raw
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(raw) = lookup("CACHE_COMPANION_DEMO_INTERVAL_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid CACHE_COMPANION_DEMO_INTERVAL_SECS '{raw}'"))?;
            config.demo_interval = Duration::from_secs(secs.max(1));
        }
        if config.node_ids.len() < 2 {
            bail!("a cluster needs at least two nodes, got {:?}", config.node_ids);
        }
        Ok(config)
    }
}

/// One running node.
pub struct ClusterNode {
    /// The node's companion.
    pub companion: CacheCompanion,
    /// The node's local cache.
    pub store: Arc<MemoryCacheStore>,
}

/// Every node of the cluster.
pub struct LocalCluster {
    bus: InMemoryMessageBus,
    nodes: Vec<ClusterNode>,
}

impl LocalCluster {
    /// Start one companion per node id, all derived from `base`.
    pub async fn start(base: &CompanionConfig, cluster: &ClusterConfig) -> Result<Self> {
        let bus = InMemoryMessageBus::new();
        let mut nodes = Vec::with_capacity(cluster.node_ids.len());

        for node_id in &cluster.node_ids {
            let config = CompanionConfig {
                node_id: node_id.clone(),
                ..base.clone()
            };
            let store = Arc::new(MemoryCacheStore::new());
            let companion = CacheCompanion::start(
                config,
                Arc::new(bus.clone()),
                store.clone(),
                Arc::new(JsonValueSerializer),
            )
            .await
            .with_context(|| format!("failed to start node {node_id}"))?;
            nodes.push(ClusterNode { companion, store });
        }

        info!(nodes = nodes.len(), topic = %base.topic_name, "Local cluster started");
        Ok(Self { bus, nodes })
    }

    #[cfg(test)]
    fn bus(&self) -> &InMemoryMessageBus {
        &self.bus
    }

    /// One demo round: node `round % n` writes a value and invalidates it on
    /// the others, then its successor fetches it from the writer.
    pub async fn demo_round(&self, round: u64, cancel: &CancellationToken) -> PeerGetOutcome {
        let count = self.nodes.len() as u64;
        let writer = &self.nodes[(round % count) as usize];
        let reader = &self.nodes[((round + 1) % count) as usize];
        let writer_id = writer.companion.node_id();

        let key = CacheKey::new(format!("round-{round}"));
        let value = CachedValue::new(
            "DemoEntry",
            serde_json::json!({ "round": round, "written_at": Utc::now().to_rfc3339() }),
        );
        let created_at_ms = value.created_at_ms;
        writer.store.insert(key.clone(), value);

        if let Err(err) = writer
            .companion
            .broadcaster()
            .notify_invalidation(&InvalidationDescriptor::new(key.clone(), writer_id))
            .await
        {
            warn!(node_id = writer_id, error = %err, "Invalidation broadcast failed");
        }

        let outcome = reader
            .companion
            .peer(writer_id)
            .get(
                &key,
                Some(created_at_ms),
                || warn!(key = %key, "Peer could not supply value"),
                cancel,
            )
            .await;

        match &outcome {
            PeerGetOutcome::Found(found) => info!(
                reader = reader.companion.node_id(),
                writer = writer_id,
                key = %key,
                size_bytes = found.size_bytes,
                latency_us = found.latency.as_micros() as u64,
                "Fetched value from peer"
            ),
            other => info!(
                reader = reader.companion.node_id(),
                writer = writer_id,
                key = %key,
                outcome = ?other,
                "Peer fetch missed"
            ),
        }
        outcome
    }

    /// Shut every node down.
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.companion.shutdown().await;
        }
        info!(
            connections_opened = self.bus.connection_count(),
            "Local cluster stopped"
        );
    }
}
