//! # Companion Node
//!
//! Runs a local cluster of cache companions over the in-memory bus.
//!
//! ## Startup Sequence
//!
//! 1. Install the tracing subscriber (`RUST_LOG`, default `info`)
//! 2. Load `CACHE_COMPANION_*` configuration
//! 3. Start one companion per cluster node
//! 4. Run demo rounds until Ctrl+C
//! 5. Shut every node down, removing their subscriptions

mod cluster;

use anyhow::{Context, Result};
use cache_companion::CompanionConfig;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::cluster::{ClusterConfig, LocalCluster};

const DEFAULT_CONNECTION_STRING: &str = "memory://local";

fn load_config() -> Result<(CompanionConfig, ClusterConfig)> {
    let mut base = CompanionConfig::from_env().context("invalid companion configuration")?;
    if base.connection_string.trim().is_empty() {
        base.connection_string = DEFAULT_CONNECTION_STRING.to_string();
    }
    let cluster = ClusterConfig::from_env()?;
    Ok((base, cluster))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (base, cluster_config) = load_config()?;
    info!(
        nodes = ?cluster_config.node_ids,
        topic = %base.topic_name,
        request_timeout_ms = base.request_timeout_ms,
        "Starting local cache cluster"
    );

    let cluster = LocalCluster::start(&base, &cluster_config).await?;

    let cancel = CancellationToken::new();
    let demo = {
        let cancel = cancel.clone();
        let period = cluster_config.demo_interval;
        let cluster = &cluster;
        async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut round = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        cluster.demo_round(round, &cancel).await;
                        round += 1;
                    }
                }
            }
        }
    };

    info!("Cluster is running. Press Ctrl+C to stop.");
    tokio::select! {
        () = demo => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    }

    // Graceful shutdown
    cluster.shutdown().await;
    Ok(())
}
