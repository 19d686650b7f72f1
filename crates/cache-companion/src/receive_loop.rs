//! # Receive Loop
//!
//! One long-lived task per node pulling from its subscription.
//!
//! ```text
//! Disconnected ──install()──→ Connecting ──create_receiver()──→ Listening
//!      ↑                          │                                │
//!      └──────── failure ─────────┴──────── transport error ───────┘
//!
//! any state ──cancel──→ Stopped
//! ```
//!
//! Runtime failures are never fatal: the connection is invalidated and the
//! loop reinstalls after a backoff. Each message is processed on its own
//! task; in-flight tasks are drained before the stop latch fires.

use crate::config::CompanionConfig;
use crate::connection::{BusConnection, BusConnectionHolder};
use crate::error::CompanionError;
use crate::processor::MessageProcessor;
use crate::retry::RetryPolicy;
use crate::stats::CompanionStats;
use crate::topology::TopologyInstaller;
use shared_bus::MessageReceiver;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Where the loop currently is.
enum LoopState {
    Disconnected,
    Connecting(Arc<BusConnection>),
    Listening {
        conn: Arc<BusConnection>,
        receiver: Arc<dyn MessageReceiver>,
    },
    Stopped,
}

/// Handle to a running loop.
pub struct ReceiveLoopHandle {
    /// The loop task.
    pub task: JoinHandle<()>,
    /// Fires once the loop and every message task it started have finished.
    pub stopped: oneshot::Receiver<()>,
}

/// The receive loop and its collaborators.
pub struct ReceiveLoop {
    config: Arc<CompanionConfig>,
    installer: Arc<TopologyInstaller>,
    holder: Arc<BusConnectionHolder>,
    processor: Arc<MessageProcessor>,
    stats: Arc<CompanionStats>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl ReceiveLoop {
    /// Create a loop stopped by `cancel`.
    pub fn new(
        config: Arc<CompanionConfig>,
        installer: Arc<TopologyInstaller>,
        holder: Arc<BusConnectionHolder>,
        processor: Arc<MessageProcessor>,
        stats: Arc<CompanionStats>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            config,
            installer,
            holder,
            processor,
            stats,
            retry,
            cancel,
        }
    }

    /// Start the loop, optionally on an already installed connection.
    pub fn spawn(self, initial: Option<Arc<BusConnection>>) -> ReceiveLoopHandle {
        let (stopped_tx, stopped) = oneshot::channel();
        let task = tokio::spawn(async move {
            self.run(initial).await;
            let _ = stopped_tx.send(());
        });
        ReceiveLoopHandle { task, stopped }
    }

    async fn run(self, initial: Option<Arc<BusConnection>>) {
        let node_id = self.config.node_id.clone();
        let mut tasks = JoinSet::new();
        let mut failures = 0u32;
        let mut state = match initial {
            Some(conn) => LoopState::Connecting(conn),
            None => LoopState::Disconnected,
        };

        info!(node_id = %node_id, "Receive loop started");

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(&node_id, result);
            }

            state = match state {
                LoopState::Stopped => break,
                LoopState::Disconnected => self.reconnect(&mut failures).await,
                LoopState::Connecting(conn) => self.open_receiver(conn, &mut failures).await,
                LoopState::Listening { conn, receiver } => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => LoopState::Stopped,
                        result = receiver.receive(self.config.receive_wait()) => match result {
                            Ok(Some(message)) => {
                                trace!(
                                    node_id = %node_id,
                                    message_id = %message.message.message_id,
                                    delivery_count = message.delivery_count,
                                    "Message received"
                                );
                                let processor = Arc::clone(&self.processor);
                                let task_receiver = Arc::clone(&receiver);
                                tasks.spawn(async move {
                                    let disposition =
                                        processor.process(task_receiver.as_ref(), message).await;
                                    trace!(?disposition, "Message settled");
                                });
                                LoopState::Listening { conn, receiver }
                            }
                            Ok(None) => LoopState::Listening { conn, receiver },
                            Err(err) => {
                                warn!(
                                    node_id = %node_id,
                                    error = %err,
                                    "Receive failed, reconnecting"
                                );
                                self.holder.invalidate(conn.generation).await;
                                failures += 1;
                                LoopState::Disconnected
                            }
                        }
                    }
                }
            };
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            debug!(node_id = %node_id, in_flight, "Draining message tasks");
        }
        while let Some(result) = tasks.join_next().await {
            log_task_result(&node_id, result);
        }
        info!(node_id = %node_id, "Receive loop stopped");
    }

    async fn reconnect(&self, failures: &mut u32) -> LoopState {
        let previous_failures = *failures;
        if previous_failures > 0 {
            let delay = self.retry.backoff(previous_failures - 1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => return LoopState::Stopped,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => LoopState::Stopped,
            result = self.installer.install() => match result {
                Ok(conn) => {
                    CompanionStats::incr(&self.stats.reconnects);
                    LoopState::Connecting(conn)
                }
                Err(CompanionError::Stopped) => LoopState::Stopped,
                Err(err) => {
                    warn!(error = %err, attempt = previous_failures + 1, "Reinstall failed");
                    *failures += 1;
                    LoopState::Disconnected
                }
            }
        }
    }

    async fn open_receiver(&self, conn: Arc<BusConnection>, failures: &mut u32) -> LoopState {
        let topic = self.config.topic_name.as_str();
        let subscription = self.config.node_id.as_str();

        match conn.client.create_receiver(topic, subscription).await {
            Ok(receiver) => {
                *failures = 0;
                debug!(subscription, generation = conn.generation, "Listening");
                LoopState::Listening { conn, receiver }
            }
            Err(err) => {
                warn!(subscription, error = %err, "Cannot open receiver");
                self.holder.invalidate(conn.generation).await;
                *failures += 1;
                LoopState::Disconnected
            }
        }
    }
}

/// Log a message task that panicked or was aborted. Returns whether the task
/// ran to completion.
fn log_task_result(node_id: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(node_id = %node_id, error = %err, "Message task failed");
            false
        }
    }
}
