//! # Peer Cache Location
//!
//! Asks one named peer for a key.
//!
//! A peer that is down, slow, or holds nothing useful is not an error: the
//! caller gets `NotFound` or `TimedOut`, its `on_invalid` callback runs once,
//! and it falls back to the source of truth.

use crate::connection::BusConnectionHolder;
use crate::domain::protocol::{self, Subject};
use crate::domain::{CacheKey, CachedValue, GetRequest};
use crate::error::CompanionError;
use crate::pending::PendingResponseRegistry;
use crate::ports::ValueSerializer;
use crate::stats::CompanionStats;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A value fetched from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerValue {
    /// The decoded value.
    pub value: CachedValue,
    /// Size of the serialized value on the wire.
    pub size_bytes: usize,
    /// Time from sending the request to holding the decoded value.
    pub latency: Duration,
}

/// Result of asking a peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerGetOutcome {
    /// The peer sent a fresh enough value.
    Found(PeerValue),
    /// The peer answered without a usable value.
    NotFound,
    /// No complete answer before the timeout or the caller's cancellation.
    TimedOut,
}

impl PeerGetOutcome {
    /// The value, if one was found.
    pub fn into_value(self) -> Option<CachedValue> {
        match self {
            PeerGetOutcome::Found(found) => Some(found.value),
            _ => None,
        }
    }
}

/// Client side of the get-request exchange with one peer.
#[derive(Clone)]
pub struct PeerCacheLocation {
    node_id: String,
    peer_id: String,
    timeout: Duration,
    holder: Arc<BusConnectionHolder>,
    registry: Arc<PendingResponseRegistry>,
    serializer: Arc<dyn ValueSerializer>,
    stats: Arc<CompanionStats>,
}

impl PeerCacheLocation {
    pub(crate) fn new(
        node_id: String,
        peer_id: String,
        timeout: Duration,
        holder: Arc<BusConnectionHolder>,
        registry: Arc<PendingResponseRegistry>,
        serializer: Arc<dyn ValueSerializer>,
        stats: Arc<CompanionStats>,
    ) -> Self {
        Self {
            node_id,
            peer_id,
            timeout,
            holder,
            registry,
            serializer,
            stats,
        }
    }

    /// The peer this location asks.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Ask the peer for `key`, accepting only values created at or after
    /// `min_created_at_ms`.
    ///
    /// `on_invalid` runs exactly once unless a value is found.
    pub async fn get<F>(
        &self,
        key: &CacheKey,
        min_created_at_ms: Option<u64>,
        on_invalid: F,
        cancel: &CancellationToken,
    ) -> PeerGetOutcome
    where
        F: FnOnce(),
    {
        let started = Instant::now();
        let correlation_id = Uuid::new_v4().to_string();

        let reply = tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(
                self.timeout,
                self.exchange(key, min_created_at_ms, &correlation_id),
            ) => match result {
                Ok(Ok(bytes)) => Some(bytes),
                Ok(Err(err)) => {
                    warn!(peer = %self.peer_id, key = %key, error = %err, "Get-request not sent");
                    None
                }
                Err(_) => None,
            },
        };
        self.registry.remove(&correlation_id);

        let outcome = match reply {
            None => {
                CompanionStats::incr(&self.stats.timeouts);
                debug!(
                    peer = %self.peer_id,
                    key = %key,
                    correlation_id = %correlation_id,
                    "No answer from peer"
                );
                PeerGetOutcome::TimedOut
            }
            Some(bytes) => self.decode_reply(key, min_created_at_ms, &bytes, started),
        };

        if !matches!(outcome, PeerGetOutcome::Found(_)) {
            on_invalid();
        }
        outcome
    }

    async fn exchange(
        &self,
        key: &CacheKey,
        min_created_at_ms: Option<u64>,
        correlation_id: &str,
    ) -> Result<Bytes, CompanionError> {
        let body = protocol::encode(&GetRequest {
            key: key.clone(),
            min_created_at_ms,
        })?;
        let request = protocol::envelope(
            Subject::GetRequest,
            &self.node_id,
            Some(&self.peer_id),
            body,
        )
        .with_message_id(correlation_id);

        self.holder.send(request, self.timeout).await?;
        CompanionStats::incr(&self.stats.requests_sent);

        // Only the enclosing timeout ends this wait.
        let reply = self
            .registry
            .get(correlation_id, std::future::pending())
            .await;
        reply.ok_or(CompanionError::Stopped)
    }

    fn decode_reply(
        &self,
        key: &CacheKey,
        min_created_at_ms: Option<u64>,
        bytes: &Bytes,
        started: Instant,
    ) -> PeerGetOutcome {
        if bytes.is_empty() {
            CompanionStats::incr(&self.stats.answers_missing);
            debug!(peer = %self.peer_id, key = %key, "Peer has no value");
            return PeerGetOutcome::NotFound;
        }

        match self.serializer.deserialize(bytes) {
            Ok(value) if value.is_fresh(min_created_at_ms) => {
                CompanionStats::incr(&self.stats.answers_found);
                let latency = started.elapsed();
                debug!(
                    peer = %self.peer_id,
                    key = %key,
                    size_bytes = bytes.len(),
                    latency_ms = latency.as_millis() as u64,
                    "Peer value received"
                );
                PeerGetOutcome::Found(PeerValue {
                    value,
                    size_bytes: bytes.len(),
                    latency,
                })
            }
            Ok(_) => {
                CompanionStats::incr(&self.stats.answers_missing);
                debug!(peer = %self.peer_id, key = %key, "Peer value too old");
                PeerGetOutcome::NotFound
            }
            Err(err) => {
                CompanionStats::incr(&self.stats.answers_missing);
                warn!(peer = %self.peer_id, key = %key, error = %err, "Undecodable peer value");
                PeerGetOutcome::NotFound
            }
        }
    }
}
