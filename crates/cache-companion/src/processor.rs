//! # Message Processor
//!
//! Handles one inbound message and settles it exactly once.
//!
//! | Subject | Effect |
//! |---------|--------|
//! | `GetRequest` | answer the requester from the local store (chunked) |
//! | `GetResponse` | feed the chunk into the pending-response registry |
//! | `CacheMiss` | `LocalCacheStore::apply_external_miss` |
//! | `Invalidate` | `LocalCacheStore::apply_invalidation` |
//!
//! Messages are completed as soon as their body is understood, before any
//! side effect runs. Undecodable messages and unknown subjects are
//! dead-lettered with the failure as reason. A message without `source`
//! is abandoned and left to the broker's delivery limit. Messages this node
//! sent itself, or addressed to another node, are completed untouched.

use crate::chunking::{split_payload, MAX_CHUNK_COUNT};
use crate::config::CompanionConfig;
use crate::connection::BusConnectionHolder;
use crate::domain::protocol::{self, Subject, PROP_DESTINATION, PROP_SOURCE};
use crate::domain::{CacheMissDescriptor, GetRequest, InvalidationDescriptor};
use crate::error::CompanionError;
use crate::pending::PendingResponseRegistry;
use crate::ports::{LocalCacheStore, ValueSerializer};
use crate::stats::CompanionStats;
use bytes::Bytes;
use futures::future::join_all;
use shared_bus::{BusError, BusMessage, MessageReceiver, ReceivedMessage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Removed from the subscription.
    Completed,
    /// Handed back for redelivery.
    Abandoned,
    /// Parked in the dead-letter queue.
    DeadLettered,
    /// The broker rejected the settlement (lock lost or receiver closed).
    SettlementFailed,
}

/// Settles one message at most once.
struct Settlement<'a> {
    receiver: &'a dyn MessageReceiver,
    message: &'a ReceivedMessage,
    outcome: Option<Disposition>,
}

impl<'a> Settlement<'a> {
    fn new(receiver: &'a dyn MessageReceiver, message: &'a ReceivedMessage) -> Self {
        Self {
            receiver,
            message,
            outcome: None,
        }
    }

    fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }

    async fn complete(&mut self) {
        let result = self.receiver.complete(self.message).await;
        self.record(Disposition::Completed, result);
    }

    async fn abandon(&mut self) {
        let result = self.receiver.abandon(self.message).await;
        self.record(Disposition::Abandoned, result);
    }

    async fn dead_letter(&mut self, reason: &str) {
        let result = self.receiver.dead_letter(self.message, reason).await;
        self.record(Disposition::DeadLettered, result);
    }

    fn record(&mut self, intended: Disposition, result: Result<(), BusError>) {
        let outcome = match result {
            Ok(()) => intended,
            Err(err) => {
                warn!(
                    message_id = %self.message.message.message_id,
                    intended = ?intended,
                    error = %err,
                    "Failed to settle message"
                );
                Disposition::SettlementFailed
            }
        };
        self.outcome = Some(outcome);
    }

    /// Abandon if nothing settled the message yet.
    async fn finish(mut self) -> Disposition {
        if self.outcome.is_none() {
            self.abandon().await;
        }
        self.outcome.unwrap_or(Disposition::SettlementFailed)
    }
}

/// Dispatches inbound messages by subject.
pub struct MessageProcessor {
    node_id: String,
    chunk_size: usize,
    send_wait: Duration,
    holder: Arc<BusConnectionHolder>,
    registry: Arc<PendingResponseRegistry>,
    store: Arc<dyn LocalCacheStore>,
    serializer: Arc<dyn ValueSerializer>,
    stats: Arc<CompanionStats>,
}

impl MessageProcessor {
    /// Create a processor for the node described by `config`.
    pub fn new(
        config: &CompanionConfig,
        holder: Arc<BusConnectionHolder>,
        registry: Arc<PendingResponseRegistry>,
        store: Arc<dyn LocalCacheStore>,
        serializer: Arc<dyn ValueSerializer>,
        stats: Arc<CompanionStats>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            chunk_size: config.chunk_size_bytes,
            send_wait: config.request_timeout(),
            holder,
            registry,
            store,
            serializer,
            stats,
        }
    }

    /// Handle and settle one received message.
    pub async fn process(
        &self,
        receiver: &dyn MessageReceiver,
        received: ReceivedMessage,
    ) -> Disposition {
        let mut settlement = Settlement::new(receiver, &received);
        let message = &received.message;

        if let Err(err) = self.dispatch(&mut settlement, message).await {
            if settlement.is_settled() {
                warn!(
                    node_id = %self.node_id,
                    message_id = %message.message_id,
                    subject = %message.subject,
                    error = %err,
                    "Message handling failed after completion"
                );
            } else {
                warn!(
                    node_id = %self.node_id,
                    message_id = %message.message_id,
                    subject = %message.subject,
                    error = %err,
                    "Dead-lettering message"
                );
                settlement.dead_letter(&err.to_string()).await;
            }
        }

        let disposition = settlement.finish().await;
        let counter = match disposition {
            Disposition::Completed => &self.stats.messages_processed,
            Disposition::DeadLettered => &self.stats.messages_dead_lettered,
            Disposition::Abandoned => &self.stats.messages_abandoned,
            Disposition::SettlementFailed => return disposition,
        };
        CompanionStats::incr(counter);
        disposition
    }

    async fn dispatch(
        &self,
        settlement: &mut Settlement<'_>,
        message: &BusMessage,
    ) -> Result<(), CompanionError> {
        let Some(source) = message.string_property(PROP_SOURCE) else {
            warn!(
                message_id = %message.message_id,
                subject = %message.subject,
                "Message without source, abandoning"
            );
            settlement.abandon().await;
            return Ok(());
        };

        // `$Default` accepts everything until the peer rule replaces it.
        if source == self.node_id {
            debug!(node_id = %self.node_id, "Ignoring own message");
            settlement.complete().await;
            return Ok(());
        }

        if let Some(destination) = message.string_property(PROP_DESTINATION) {
            if destination != self.node_id {
                debug!(destination, "Message addressed to another node");
                settlement.complete().await;
                return Ok(());
            }
        }

        let subject = Subject::parse(&message.subject).ok_or_else(|| {
            CompanionError::Protocol(format!("unknown subject '{}'", message.subject))
        })?;

        debug!(
            node_id = %self.node_id,
            message_id = %message.message_id,
            subject = subject.as_str(),
            source,
            "Processing message"
        );

        match subject {
            Subject::GetRequest => {
                let request: GetRequest = protocol::decode(&message.body)?;
                settlement.complete().await;
                self.answer(source, &message.message_id, &request).await
            }
            Subject::GetResponse => {
                let correlation_id = message.correlation_id.as_deref().ok_or_else(|| {
                    CompanionError::Protocol("response without correlation id".into())
                })?;
                let (index, count) = protocol::chunk_position(message)?;
                settlement.complete().await;
                self.registry
                    .set(correlation_id, index, count, message.body.clone())?;
                Ok(())
            }
            Subject::CacheMiss => {
                let descriptor: CacheMissDescriptor = protocol::decode(&message.body)?;
                settlement.complete().await;
                self.store.apply_external_miss(&descriptor);
                Ok(())
            }
            Subject::Invalidate => {
                let descriptor: InvalidationDescriptor = protocol::decode(&message.body)?;
                settlement.complete().await;
                self.store.apply_invalidation(&descriptor);
                Ok(())
            }
        }
    }

    /// Send the local value for `request` back to `requester`.
    ///
    /// Absent, stale, unserializable and oversized values are answered with
    /// one empty chunk so the requester does not wait for its timeout.
    async fn answer(
        &self,
        requester: &str,
        correlation_id: &str,
        request: &GetRequest,
    ) -> Result<(), CompanionError> {
        let payload = match self.store.try_get_local_value(&request.key) {
            Some(value) if value.is_fresh(request.min_created_at_ms) => {
                match self.serializer.serialize(&value) {
                    Ok(bytes) => Bytes::from(bytes),
                    Err(err) => {
                        warn!(key = %request.key, error = %err, "Cannot serialize local value");
                        Bytes::new()
                    }
                }
            }
            Some(_) => {
                debug!(key = %request.key, "Local value older than requested");
                Bytes::new()
            }
            None => Bytes::new(),
        };

        let mut chunks = split_payload(payload, self.chunk_size);
        if chunks.len() > MAX_CHUNK_COUNT {
            warn!(
                key = %request.key,
                chunks = chunks.len(),
                max = MAX_CHUNK_COUNT,
                "Local value too large to send"
            );
            chunks = vec![Bytes::new()];
        }
        let count = chunks.len();
        debug!(
            key = %request.key,
            requester,
            correlation_id,
            chunks = count,
            "Answering get-request"
        );

        let sends = chunks.into_iter().enumerate().map(|(i, body)| {
            let chunk = protocol::response_chunk(
                &self.node_id,
                requester,
                correlation_id,
                i + 1,
                count,
                body,
            );
            self.holder.send(chunk, self.send_wait)
        });
        join_all(sends).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{JsonValueSerializer, MemoryCacheStore};
    use crate::domain::CachedValue;
    use crate::topology::TopologyInstaller;
    use shared_bus::{BusClient, InMemoryMessageBus, MessageSender, RuleDescription, RuleFilter};

    struct Fixture {
        bus: InMemoryMessageBus,
        store: Arc<MemoryCacheStore>,
        registry: Arc<PendingResponseRegistry>,
        processor: MessageProcessor,
        receiver: Arc<dyn MessageReceiver>,
        peer: Arc<dyn MessageSender>,
        peer_receiver: Arc<dyn MessageReceiver>,
    }

    async fn fixture(chunk_size: usize) -> Fixture {
        let bus = InMemoryMessageBus::new();
        let mut config = CompanionConfig::for_testing("node-a");
        config.chunk_size_bytes = chunk_size;
        let config = Arc::new(config);
        let holder = Arc::new(BusConnectionHolder::new());
        let conn = TopologyInstaller::new(
            Arc::clone(&config),
            Arc::new(bus.clone()),
            Arc::clone(&holder),
        )
        .install()
        .await
        .unwrap();

        let peer_holder = Arc::new(BusConnectionHolder::new());
        let peer_conn = TopologyInstaller::new(
            Arc::new(CompanionConfig::for_testing("node-b")),
            Arc::new(bus.clone()),
            peer_holder,
        )
        .install()
        .await
        .unwrap();

        let store = Arc::new(MemoryCacheStore::new());
        let registry = Arc::new(PendingResponseRegistry::new());
        let processor = MessageProcessor::new(
            &config,
            holder,
            Arc::clone(&registry),
            store.clone(),
            Arc::new(JsonValueSerializer),
            Arc::new(CompanionStats::default()),
        );
        let receiver = conn.client.create_receiver("cache-sync", "node-a").await.unwrap();
        let peer_receiver = peer_conn
            .client
            .create_receiver("cache-sync", "node-b")
            .await
            .unwrap();

        Fixture {
            bus,
            store,
            registry,
            processor,
            receiver,
            peer: Arc::clone(&peer_conn.sender),
            peer_receiver,
        }
    }

    impl Fixture {
        async fn deliver(&self, message: BusMessage) -> Disposition {
            self.peer.send(message).await.unwrap();
            let received = self
                .receiver
                .receive(Duration::from_secs(1))
                .await
                .unwrap()
                .unwrap();
            self.processor.process(self.receiver.as_ref(), received).await
        }

        async fn peer_inbox(&self) -> Vec<BusMessage> {
            let mut messages = Vec::new();
            while let Some(received) = self
                .peer_receiver
                .receive(Duration::from_millis(50))
                .await
                .unwrap()
            {
                self.peer_receiver.complete(&received).await.unwrap();
                messages.push(received.message);
            }
            messages
        }
    }

    fn get_request(key: &str, min_created_at_ms: Option<u64>) -> BusMessage {
        let body = protocol::encode(&GetRequest {
            key: key.into(),
            min_created_at_ms,
        })
        .unwrap();
        protocol::envelope(Subject::GetRequest, "node-b", Some("node-a"), body)
            .with_message_id("corr-1")
    }

    #[tokio::test]
    async fn test_get_request_answers_with_value() {
        let fx = fixture(1024).await;
        let value = CachedValue::new("i32", serde_json::json!(42));
        fx.store.insert("k1", value.clone());

        assert_eq!(fx.deliver(get_request("k1", None)).await, Disposition::Completed);

        let replies = fx.peer_inbox().await;
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert_eq!(reply.subject, "GetResponse");
        assert_eq!(reply.correlation_id.as_deref(), Some("corr-1"));
        assert_eq!(reply.string_property(PROP_DESTINATION), Some("node-b"));
        assert_eq!(protocol::chunk_position(reply).unwrap(), (1, 1));
        assert_eq!(JsonValueSerializer.deserialize(&reply.body).unwrap(), value);
    }

    #[tokio::test]
    async fn test_get_request_chunks_large_values() {
        let fx = fixture(64).await;
        let value = CachedValue::new("blob", serde_json::json!("x".repeat(300)));
        fx.store.insert("big", value);

        fx.deliver(get_request("big", None)).await;

        let replies = fx.peer_inbox().await;
        let count = replies.len();
        assert!(count > 1);
        for reply in &replies {
            let (_, declared) = protocol::chunk_position(reply).unwrap();
            assert_eq!(declared, count);
            assert!(reply.body.len() <= 64);
        }
    }

    #[tokio::test]
    async fn test_missing_or_stale_value_sends_empty_chunk() {
        let fx = fixture(1024).await;
        fx.store
            .insert("old", CachedValue::new("i32", serde_json::json!(1)).with_created_at(10));

        fx.deliver(get_request("absent", None)).await;
        fx.deliver(get_request("old", Some(20))).await;

        let replies = fx.peer_inbox().await;
        assert_eq!(replies.len(), 2);
        assert!(replies.iter().all(|r| r.body.is_empty()));
    }

    #[tokio::test]
    async fn test_get_response_fills_registry() {
        let fx = fixture(1024).await;
        let chunk =
            protocol::response_chunk("node-b", "node-a", "corr-9", 1, 1, Bytes::from_static(b"v"));

        assert_eq!(fx.deliver(chunk).await, Disposition::Completed);
        let value = fx.registry.get("corr-9", std::future::pending()).await;
        assert_eq!(value.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_response_without_correlation_is_dead_lettered() {
        let fx = fixture(1024).await;
        let orphan = protocol::envelope(Subject::GetResponse, "node-b", Some("node-a"), Vec::new());

        assert_eq!(fx.deliver(orphan).await, Disposition::DeadLettered);
        let dead = fx.bus.dead_letters("cache-sync", "node-a");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("correlation"));
    }

    #[tokio::test]
    async fn test_oversized_chunk_count_is_dead_lettered() {
        let fx = fixture(1024).await;
        let chunk = protocol::envelope(
            Subject::GetResponse,
            "node-b",
            Some("node-a"),
            Bytes::from_static(b"v"),
        )
        .with_correlation_id("corr-7")
        .with_property(protocol::PROP_CHUNK_INDEX, 1i64)
        .with_property(protocol::PROP_CHUNK_COUNT, i64::MAX);

        assert_eq!(fx.deliver(chunk).await, Disposition::DeadLettered);
        let dead = fx.bus.dead_letters("cache-sync", "node-a");
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("exceeds the limit"));
        assert!(!fx.registry.contains("corr-7"));

        // The correlation id still accepts a well-formed reply.
        let valid =
            protocol::response_chunk("node-b", "node-a", "corr-7", 1, 1, Bytes::from_static(b"v"));
        assert_eq!(fx.deliver(valid).await, Disposition::Completed);
        let value = fx.registry.get("corr-7", std::future::pending()).await;
        assert_eq!(value.unwrap(), Bytes::from_static(b"v"));
    }

    #[tokio::test]
    async fn test_oversized_local_value_answered_empty() {
        let fx = fixture(1).await;
        let value = CachedValue::new("blob", serde_json::json!("x".repeat(MAX_CHUNK_COUNT)));
        fx.store.insert("huge", value);

        assert_eq!(fx.deliver(get_request("huge", None)).await, Disposition::Completed);

        let replies = fx.peer_inbox().await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].body.is_empty());
        assert_eq!(protocol::chunk_position(&replies[0]).unwrap(), (1, 1));
    }

    #[tokio::test]
    async fn test_own_message_completed_without_effect() {
        let fx = fixture(1024).await;
        let client: Arc<dyn BusClient> = fx.bus.client();
        // Stands in for `$Default` before the peer rule is installed.
        client
            .create_rule(
                "cache-sync",
                "node-a",
                &RuleDescription::new("everything", RuleFilter::True),
            )
            .await
            .unwrap();
        let sender = client.create_sender("cache-sync").await.unwrap();
        let miss = protocol::encode(&CacheMissDescriptor::new("k2", "node-a")).unwrap();
        sender
            .send(protocol::envelope(Subject::CacheMiss, "node-a", None, miss))
            .await
            .unwrap();

        let received = fx.receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        let disposition = fx.processor.process(fx.receiver.as_ref(), received).await;

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(fx.store.external_misses(&"k2".into()), 0);
        assert_eq!(fx.bus.queue_len("cache-sync", "node-a"), 0);
    }

    #[tokio::test]
    async fn test_broadcasts_reach_store() {
        let fx = fixture(1024).await;
        fx.store
            .insert("k1", CachedValue::new("i32", serde_json::json!(1)).with_created_at(10));

        let miss = protocol::encode(&CacheMissDescriptor::new("k2", "node-b")).unwrap();
        let invalidate = protocol::encode(&InvalidationDescriptor::new("k1", "node-b")).unwrap();

        assert_eq!(
            fx.deliver(protocol::envelope(Subject::CacheMiss, "node-b", None, miss)).await,
            Disposition::Completed
        );
        assert_eq!(
            fx.deliver(protocol::envelope(Subject::Invalidate, "node-b", None, invalidate)).await,
            Disposition::Completed
        );

        assert_eq!(fx.store.external_misses(&"k2".into()), 1);
        assert!(!fx.store.contains(&"k1".into()));
    }

    #[tokio::test]
    async fn test_poison_messages_dead_lettered() {
        let fx = fixture(1024).await;
        let garbage = protocol::envelope(Subject::CacheMiss, "node-b", None, vec![0xff]);
        let unknown = BusMessage::new("Shutdown", Vec::new()).with_property(PROP_SOURCE, "node-b");

        assert_eq!(fx.deliver(garbage).await, Disposition::DeadLettered);
        assert_eq!(fx.deliver(unknown).await, Disposition::DeadLettered);
        assert_eq!(fx.bus.dead_letters("cache-sync", "node-a").len(), 2);
        assert_eq!(fx.processor.stats.snapshot().messages_dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_message_without_source_is_abandoned() {
        let fx = fixture(1024).await;
        let client: Arc<dyn BusClient> = fx.bus.client();
        // The routing rule drops source-less messages; open the subscription up.
        client
            .create_rule(
                "cache-sync",
                "node-a",
                &RuleDescription::new("everything", RuleFilter::True),
            )
            .await
            .unwrap();
        let sender = client.create_sender("cache-sync").await.unwrap();
        sender.send(BusMessage::new("CacheMiss", Vec::new())).await.unwrap();

        let received = fx.receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        let disposition = fx.processor.process(fx.receiver.as_ref(), received).await;

        assert_eq!(disposition, Disposition::Abandoned);
        assert_eq!(fx.bus.queue_len("cache-sync", "node-a"), 1);
    }
}
