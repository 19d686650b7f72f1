//! # Bus Connection Holder
//!
//! Owns the node's current bus client and topic sender.
//!
//! ```text
//! Disconnected ──mark_connecting()──→ Connecting ──publish()──→ Connected(conn)
//!      ↑                                   │                          │
//!      └──────── mark_disconnected() ──────┘←──── invalidate(gen) ────┘
//!
//! any state ──close()──→ Closed (terminal)
//! ```
//!
//! Only the receive loop and startup change the state. Senders wait on the
//! watch channel until a connection is published or the holder closes.

use crate::error::CompanionError;
use shared_bus::{BusClient, BusMessage, MessageSender};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// A live client plus the sender opened on the shared topic.
pub struct BusConnection {
    /// Administrative client
    pub client: Arc<dyn BusClient>,
    /// Sender publishing to the shared topic
    pub sender: Arc<dyn MessageSender>,
    /// Increases with every published connection
    pub generation: u64,
}

impl fmt::Debug for BusConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusConnection")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    /// No usable connection.
    Disconnected,
    /// Provisioning in progress.
    Connecting,
    /// Ready to send.
    Connected(Arc<BusConnection>),
    /// Shut down; never leaves this state.
    Closed,
}

impl ConnectionState {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected(_) => "connected",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether a connection is available.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

/// Shared holder of the current connection.
pub struct BusConnectionHolder {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
}

impl Default for BusConnectionHolder {
    fn default() -> Self {
        Self::new()
    }
}

impl BusConnectionHolder {
    /// Create a disconnected holder.
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            generation: AtomicU64::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// The connection, if one is published.
    pub fn current(&self) -> Option<Arc<BusConnection>> {
        match &*self.state.borrow() {
            ConnectionState::Connected(conn) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Enter `Connecting` unless closed.
    pub fn mark_connecting(&self) {
        self.transition(ConnectionState::Connecting);
    }

    /// Enter `Disconnected` unless closed.
    pub fn mark_disconnected(&self) {
        self.transition(ConnectionState::Disconnected);
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Closed) {
                return false;
            }
            debug!(from = state.label(), to = next.label(), "Connection state change");
            *state = next;
            true
        });
    }

    /// Publish a freshly provisioned connection.
    ///
    /// Fails with `Stopped` if the holder closed meanwhile; the client is then
    /// closed instead of leaking.
    pub async fn publish(
        &self,
        client: Arc<dyn BusClient>,
        sender: Arc<dyn MessageSender>,
    ) -> Result<Arc<BusConnection>, CompanionError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(BusConnection {
            client,
            sender,
            generation,
        });

        let published = self.state.send_if_modified(|state| {
            if matches!(state, ConnectionState::Closed) {
                return false;
            }
            *state = ConnectionState::Connected(Arc::clone(&conn));
            true
        });

        if !published {
            conn.client.close().await;
            return Err(CompanionError::Stopped);
        }
        info!(generation, "Bus connection established");
        Ok(conn)
    }

    /// Drop connection `generation` after a transport failure and close its
    /// client. A newer connection is left alone.
    pub async fn invalidate(&self, generation: u64) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| match state {
            ConnectionState::Connected(conn) if conn.generation == generation => {
                previous = Some(Arc::clone(conn));
                *state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        });

        match previous {
            Some(conn) => {
                info!(generation, "Bus connection invalidated");
                conn.client.close().await;
                true
            }
            None => false,
        }
    }

    /// Wait until a connection is published. Fails with `Stopped` once closed.
    pub async fn connected(&self) -> Result<Arc<BusConnection>, CompanionError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectionState::Connected(_) | ConnectionState::Closed
                )
            })
            .await
            .map_err(|_| CompanionError::Stopped)?;

        let conn = match &*state {
            ConnectionState::Connected(conn) => Ok(Arc::clone(conn)),
            _ => Err(CompanionError::Stopped),
        };
        conn
    }

    /// Send on the current connection, waiting at most `wait` for one.
    pub async fn send(&self, message: BusMessage, wait: Duration) -> Result<(), CompanionError> {
        let conn = tokio::time::timeout(wait, self.connected())
            .await
            .map_err(|_| CompanionError::SendTimedOut)??;
        conn.sender.send(message).await?;
        Ok(())
    }

    /// Enter `Closed` and close any published client.
    pub async fn close(&self) {
        let previous = self.state.send_replace(ConnectionState::Closed);
        if let ConnectionState::Connected(conn) = previous {
            conn.client.close().await;
            info!(generation = conn.generation, "Bus connection closed");
        }
    }
}
