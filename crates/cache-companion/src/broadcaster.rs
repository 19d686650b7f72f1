//! Broadcasts cache events to every other node.

use crate::connection::BusConnectionHolder;
use crate::domain::protocol::{self, Subject};
use crate::domain::{CacheMissDescriptor, InvalidationDescriptor};
use crate::error::CompanionError;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Sends `CacheMiss` and `Invalidate` events without a destination.
#[derive(Clone)]
pub struct EventBroadcaster {
    node_id: String,
    send_wait: Duration,
    holder: Arc<BusConnectionHolder>,
}

impl EventBroadcaster {
    pub(crate) fn new(
        node_id: String,
        send_wait: Duration,
        holder: Arc<BusConnectionHolder>,
    ) -> Self {
        Self {
            node_id,
            send_wait,
            holder,
        }
    }

    /// Tell peers this node missed a key.
    pub async fn notify_cache_miss(
        &self,
        descriptor: &CacheMissDescriptor,
    ) -> Result<(), CompanionError> {
        debug!(key = %descriptor.key, "Broadcasting cache miss");
        self.broadcast(Subject::CacheMiss, descriptor).await
    }

    /// Tell peers a key changed at its source.
    pub async fn notify_invalidation(
        &self,
        descriptor: &InvalidationDescriptor,
    ) -> Result<(), CompanionError> {
        debug!(key = %descriptor.key, "Broadcasting invalidation");
        self.broadcast(Subject::Invalidate, descriptor).await
    }

    async fn broadcast<T: Serialize>(
        &self,
        subject: Subject,
        body: &T,
    ) -> Result<(), CompanionError> {
        let body = protocol::encode(body)?;
        let message = protocol::envelope(subject, &self.node_id, None, body);
        self.holder.send(message, self.send_wait).await
    }
}
