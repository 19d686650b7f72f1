//! # In-Memory Message Bus
//!
//! A single-process broker with topic/subscription/rule semantics.
//!
//! Suitable for tests and single-host clusters; distributed deployments plug a
//! hosted broker in behind the same ports.
//!
//! ## Delivery Model
//!
//! - A published message is copied into every subscription with at least one
//!   matching rule.
//! - `receive` hands out messages under a peek-lock. A lock that expires, or
//!   an `abandon`, puts the message back with its delivery count kept.
//! - Once a message has been delivered `max_delivery_count` times, the next
//!   release dead-letters it instead.
//! - Messages past their TTL are dropped (or dead-lettered, if the
//!   subscription asks for it) when they reach the head of the queue.

use crate::error::BusError;
use crate::filter::{RuleDescription, RuleFilter, DEFAULT_RULE_NAME};
use crate::message::{BusMessage, ReceivedMessage};
use crate::ports::{
    BusClient, BusConnector, MessageReceiver, MessageSender, SubscriptionOptions, TopicOptions,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Reason recorded when the broker gives up on a message.
pub const MAX_DELIVERY_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Reason recorded when an expired message is dead-lettered.
pub const TTL_EXPIRED: &str = "TTLExpiredException";

/// A message parked in a subscription's dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The original message.
    pub message: BusMessage,
    /// Why it was dead-lettered.
    pub reason: String,
    /// Deliveries made before it was parked.
    pub delivery_count: u32,
}

struct Queued {
    message: BusMessage,
    expires_at: Instant,
    delivery_count: u32,
}

struct Locked {
    queued: Queued,
    locked_until: Instant,
}

struct SubscriptionState {
    options: SubscriptionOptions,
    rules: Vec<RuleDescription>,
    queue: VecDeque<Queued>,
    locked: HashMap<Uuid, Locked>,
    dead_letters: Vec<DeadLetter>,
    notify: Arc<Notify>,
}

impl SubscriptionState {
    fn new(options: SubscriptionOptions) -> Self {
        Self {
            options,
            rules: vec![RuleDescription::new(DEFAULT_RULE_NAME, RuleFilter::True)],
            queue: VecDeque::new(),
            locked: HashMap::new(),
            dead_letters: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn accepts(&self, message: &BusMessage) -> bool {
        self.rules.iter().any(|rule| rule.filter.matches(message))
    }

    /// Return expired locks to the queue.
    fn reclaim_expired_locks(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                trace!(message_id = %locked.queued.message.message_id, "Lock expired");
                self.release(locked.queued);
            }
        }
    }

    /// Put a message back for redelivery, or park it once deliveries are used up.
    fn release(&mut self, queued: Queued) {
        if queued.delivery_count >= self.options.max_delivery_count {
            debug!(
                subscription = %self.options.name,
                message_id = %queued.message.message_id,
                deliveries = queued.delivery_count,
                "Max delivery count reached, dead-lettering"
            );
            self.dead_letters.push(DeadLetter {
                message: queued.message,
                reason: MAX_DELIVERY_EXCEEDED.to_string(),
                delivery_count: queued.delivery_count,
            });
        } else {
            self.queue.push_front(queued);
            self.notify.notify_one();
        }
    }

    fn pop_live(&mut self, now: Instant) -> Option<Queued> {
        while let Some(queued) = self.queue.pop_front() {
            if queued.expires_at > now {
                return Some(queued);
            }
            if self.options.dead_lettering_on_expiration {
                self.dead_letters.push(DeadLetter {
                    message: queued.message,
                    reason: TTL_EXPIRED.to_string(),
                    delivery_count: queued.delivery_count,
                });
            }
        }
        None
    }

    fn next_lock_expiry(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.locked_until).min()
    }
}

struct TopicState {
    options: TopicOptions,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct FaultPlan {
    receive_failures: AtomicU32,
    send_failures: AtomicU32,
    admin_failures: Mutex<VecDeque<BusError>>,
}

impl FaultPlan {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default)]
struct BusState {
    topics: Mutex<HashMap<String, TopicState>>,
    faults: FaultPlan,
    connections: AtomicU64,
}

impl BusState {
    fn admin_fault(&self) -> Result<(), BusError> {
        match self.faults.admin_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn with_subscription<T>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(&mut SubscriptionState) -> Result<T, BusError>,
    ) -> Result<T, BusError> {
        let mut topics = self.topics.lock();
        let sub = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.get_mut(subscription))
            .ok_or_else(|| BusError::EntityNotFound(format!("{topic}/{subscription}")))?;
        f(sub)
    }
}

/// In-process broker implementing every bus port.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    state: Arc<BusState>,
}

impl InMemoryMessageBus {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client without going through a connection string.
    #[must_use]
    pub fn client(&self) -> Arc<dyn BusClient> {
        self.state.connections.fetch_add(1, Ordering::Relaxed);
        Arc::new(MemoryClient {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Number of clients opened so far.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Make the next `count` receive calls fail with a transient error.
    pub fn fail_next_receives(&self, count: u32) {
        self.state
            .faults
            .receive_failures
            .fetch_add(count, Ordering::SeqCst);
    }

    /// Make the next `count` send calls fail with a transient error.
    pub fn fail_next_sends(&self, count: u32) {
        self.state.faults.send_failures.fetch_add(count, Ordering::SeqCst);
    }

    /// Make the next `count` administrative calls fail with `error`.
    pub fn fail_next_admin(&self, count: u32, error: BusError) {
        let mut queue = self.state.faults.admin_failures.lock();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Current options of a topic.
    #[must_use]
    pub fn topic_options(&self, topic: &str) -> Option<TopicOptions> {
        self.state.topics.lock().get(topic).map(|t| t.options.clone())
    }

    /// Current options of a subscription.
    #[must_use]
    pub fn subscription_options(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Option<SubscriptionOptions> {
        self.state
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(|s| s.options.clone())
    }

    /// Names of a topic's subscriptions, sorted.
    #[must_use]
    pub fn subscription_names(&self, topic: &str) -> Vec<String> {
        let topics = self.state.topics.lock();
        let mut names: Vec<String> = topics
            .get(topic)
            .map(|t| t.subscriptions.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Rules of a subscription, in creation order.
    #[must_use]
    pub fn rules(&self, topic: &str, subscription: &str) -> Vec<RuleDescription> {
        self.state
            .with_subscription(topic, subscription, |s| Ok(s.rules.clone()))
            .unwrap_or_default()
    }

    /// Messages waiting (not locked) in a subscription.
    #[must_use]
    pub fn queue_len(&self, topic: &str, subscription: &str) -> usize {
        self.state
            .with_subscription(topic, subscription, |s| Ok(s.queue.len()))
            .unwrap_or(0)
    }

    /// Dead-lettered messages of a subscription.
    #[must_use]
    pub fn dead_letters(&self, topic: &str, subscription: &str) -> Vec<DeadLetter> {
        self.state
            .with_subscription(topic, subscription, |s| Ok(s.dead_letters.clone()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusConnector for InMemoryMessageBus {
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn BusClient>, BusError> {
        if connection_string.trim().is_empty() {
            return Err(BusError::InvalidOperation("empty connection string".into()));
        }
        debug!(connection = connection_string, "Opening in-memory bus client");
        Ok(self.client())
    }
}

struct MemoryClient {
    state: Arc<BusState>,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn admin_call(&self) -> Result<(), BusError> {
        self.ensure_open()?;
        self.state.admin_fault()
    }
}

#[async_trait]
impl BusClient for MemoryClient {
    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError> {
        self.admin_call()?;
        Ok(self.state.topics.lock().contains_key(topic))
    }

    async fn create_topic(&self, options: &TopicOptions) -> Result<(), BusError> {
        self.admin_call()?;
        let mut topics = self.state.topics.lock();
        if topics.contains_key(&options.name) {
            return Err(BusError::EntityAlreadyExists(options.name.clone()));
        }
        topics.insert(
            options.name.clone(),
            TopicState {
                options: options.clone(),
                subscriptions: HashMap::new(),
            },
        );
        debug!(topic = %options.name, "Topic created");
        Ok(())
    }

    async fn update_topic(&self, options: &TopicOptions) -> Result<(), BusError> {
        self.admin_call()?;
        let mut topics = self.state.topics.lock();
        let topic = topics
            .get_mut(&options.name)
            .ok_or_else(|| BusError::EntityNotFound(options.name.clone()))?;
        topic.options = options.clone();
        Ok(())
    }

    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError> {
        self.admin_call()?;
        let topics = self.state.topics.lock();
        let topic_state = topics
            .get(topic)
            .ok_or_else(|| BusError::EntityNotFound(topic.to_string()))?;
        Ok(topic_state.subscriptions.contains_key(subscription))
    }

    async fn create_subscription(&self, options: &SubscriptionOptions) -> Result<(), BusError> {
        self.admin_call()?;
        let mut topics = self.state.topics.lock();
        let topic = topics
            .get_mut(&options.topic_name)
            .ok_or_else(|| BusError::EntityNotFound(options.topic_name.clone()))?;
        if topic.subscriptions.contains_key(&options.name) {
            return Err(BusError::EntityAlreadyExists(format!(
                "{}/{}",
                options.topic_name, options.name
            )));
        }
        topic
            .subscriptions
            .insert(options.name.clone(), SubscriptionState::new(options.clone()));
        debug!(topic = %options.topic_name, subscription = %options.name, "Subscription created");
        Ok(())
    }

    async fn update_subscription(&self, options: &SubscriptionOptions) -> Result<(), BusError> {
        self.admin_call()?;
        self.state
            .with_subscription(&options.topic_name, &options.name, |sub| {
                sub.options = options.clone();
                Ok(())
            })
    }

    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<(), BusError> {
        self.admin_call()?;
        let mut topics = self.state.topics.lock();
        let removed = topics
            .get_mut(topic)
            .and_then(|t| t.subscriptions.remove(subscription))
            .ok_or_else(|| BusError::EntityNotFound(format!("{topic}/{subscription}")))?;
        // Wake a parked receiver so it observes the deletion.
        removed.notify.notify_waiters();
        debug!(topic, subscription, "Subscription deleted");
        Ok(())
    }

    async fn list_rules(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<RuleDescription>, BusError> {
        self.admin_call()?;
        self.state
            .with_subscription(topic, subscription, |sub| Ok(sub.rules.clone()))
    }

    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &RuleDescription,
    ) -> Result<(), BusError> {
        self.admin_call()?;
        self.state.with_subscription(topic, subscription, |sub| {
            if sub.rules.iter().any(|r| r.name == rule.name) {
                return Err(BusError::EntityAlreadyExists(format!(
                    "{topic}/{subscription}/{}",
                    rule.name
                )));
            }
            sub.rules.push(rule.clone());
            Ok(())
        })
    }

    async fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), BusError> {
        self.admin_call()?;
        self.state.with_subscription(topic, subscription, |sub| {
            let before = sub.rules.len();
            sub.rules.retain(|r| r.name != rule);
            if sub.rules.len() == before {
                return Err(BusError::EntityNotFound(format!(
                    "{topic}/{subscription}/{rule}"
                )));
            }
            Ok(())
        })
    }

    async fn create_sender(&self, topic: &str) -> Result<Arc<dyn MessageSender>, BusError> {
        self.ensure_open()?;
        Ok(Arc::new(MemorySender {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            topic: topic.to_string(),
        }))
    }

    async fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageReceiver>, BusError> {
        self.ensure_open()?;
        // Fail fast on a missing subscription, like a broker link attach would.
        self.state.with_subscription(topic, subscription, |_| Ok(()))?;
        Ok(Arc::new(MemoryReceiver {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemorySender {
    state: Arc<BusState>,
    closed: Arc<AtomicBool>,
    topic: String,
}

#[async_trait]
impl MessageSender for MemorySender {
    async fn send(&self, message: BusMessage) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if FaultPlan::take(&self.state.faults.send_failures) {
            return Err(BusError::Transient("injected send failure".into()));
        }

        let now = Instant::now();
        let mut topics = self.state.topics.lock();
        let topic = topics
            .get_mut(&self.topic)
            .ok_or_else(|| BusError::EntityNotFound(self.topic.clone()))?;
        let ttl = message
            .time_to_live
            .unwrap_or(topic.options.default_message_ttl);

        let mut delivered = 0usize;
        for sub in topic.subscriptions.values_mut() {
            if !sub.accepts(&message) {
                continue;
            }
            sub.queue.push_back(Queued {
                message: message.clone(),
                expires_at: now + ttl,
                delivery_count: 0,
            });
            sub.notify.notify_one();
            delivered += 1;
        }

        trace!(
            topic = %self.topic,
            subject = %message.subject,
            message_id = %message.message_id,
            subscriptions = delivered,
            "Message published"
        );
        Ok(())
    }
}

enum Poll {
    Ready(ReceivedMessage),
    Wait(Arc<Notify>, Instant),
}

struct MemoryReceiver {
    state: Arc<BusState>,
    closed: Arc<AtomicBool>,
    topic: String,
    subscription: String,
}

impl MemoryReceiver {
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    fn settle(
        &self,
        message: &ReceivedMessage,
        f: impl FnOnce(&mut SubscriptionState, Queued),
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        self.state
            .with_subscription(&self.topic, &self.subscription, |sub| {
                let locked = sub
                    .locked
                    .remove(&message.lock_token)
                    .ok_or_else(|| BusError::LockLost(message.message.message_id.clone()))?;
                f(sub, locked.queued);
                Ok(())
            })
    }
}

#[async_trait]
impl MessageReceiver for MemoryReceiver {
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BusError> {
        let deadline = Instant::now() + max_wait;

        loop {
            self.ensure_open()?;
            if FaultPlan::take(&self.state.faults.receive_failures) {
                warn!(subscription = %self.subscription, "Injected receive failure");
                return Err(BusError::Transient("injected receive failure".into()));
            }

            let now = Instant::now();
            let poll = self
                .state
                .with_subscription(&self.topic, &self.subscription, |sub| {
                    sub.reclaim_expired_locks(now);
                    if let Some(mut queued) = sub.pop_live(now) {
                        queued.delivery_count += 1;
                        let lock_token = Uuid::new_v4();
                        let received = ReceivedMessage {
                            message: queued.message.clone(),
                            lock_token,
                            delivery_count: queued.delivery_count,
                        };
                        sub.locked.insert(
                            lock_token,
                            Locked {
                                queued,
                                locked_until: now + sub.options.lock_duration,
                            },
                        );
                        return Ok(Poll::Ready(received));
                    }
                    let wake_at = sub
                        .next_lock_expiry()
                        .map_or(deadline, |expiry| expiry.min(deadline));
                    Ok(Poll::Wait(Arc::clone(&sub.notify), wake_at))
                })?;

            let (notify, wake_at) = match poll {
                Poll::Ready(received) => return Ok(Some(received)),
                Poll::Wait(notify, wake_at) => (notify, wake_at),
            };
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(wake_at, notify.notified()).await;
        }
    }

    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.settle(message, |_, _| {})
    }

    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BusError> {
        self.settle(message, |sub, queued| sub.release(queued))
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), BusError> {
        self.settle(message, |sub, queued| {
            sub.dead_letters.push(DeadLetter {
                message: queued.message,
                reason: reason.to_string(),
                delivery_count: queued.delivery_count,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "cache-sync";

    fn topic_options() -> TopicOptions {
        TopicOptions {
            name: TOPIC.to_string(),
            auto_delete_on_idle: Duration::from_secs(3600),
            default_message_ttl: Duration::from_secs(60),
            enable_batched_operations: true,
        }
    }

    fn subscription_options(name: &str) -> SubscriptionOptions {
        SubscriptionOptions {
            topic_name: TOPIC.to_string(),
            name: name.to_string(),
            lock_duration: Duration::from_secs(5),
            dead_lettering_on_expiration: false,
            max_delivery_count: 2,
            enable_batched_operations: true,
        }
    }

    async fn setup(subscriptions: &[&str]) -> (InMemoryMessageBus, Arc<dyn BusClient>) {
        let bus = InMemoryMessageBus::new();
        let client = bus.client();
        client.create_topic(&topic_options()).await.unwrap();
        for name in subscriptions {
            client
                .create_subscription(&subscription_options(name))
                .await
                .unwrap();
        }
        (bus, client)
    }

    #[tokio::test]
    async fn test_create_twice_reports_already_exists() {
        let (_bus, client) = setup(&["a"]).await;

        let err = client.create_topic(&topic_options()).await.unwrap_err();
        assert!(matches!(err, BusError::EntityAlreadyExists(_)));

        let err = client
            .create_subscription(&subscription_options("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::EntityAlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_new_subscription_has_default_rule() {
        let (bus, _client) = setup(&["a"]).await;
        let rules = bus.rules(TOPIC, "a");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, DEFAULT_RULE_NAME);
        assert_eq!(rules[0].filter, RuleFilter::True);
    }

    #[tokio::test]
    async fn test_rules_route_messages() {
        let (bus, client) = setup(&["a", "b"]).await;
        client.delete_rule(TOPIC, "b", DEFAULT_RULE_NAME).await.unwrap();
        client
            .create_rule(
                TOPIC,
                "b",
                &RuleDescription::new("only-b", RuleFilter::equals("destination", "b")),
            )
            .await
            .unwrap();

        let sender = client.create_sender(TOPIC).await.unwrap();
        sender
            .send(BusMessage::new("Ping", Vec::new()).with_property("destination", "c"))
            .await
            .unwrap();
        sender
            .send(BusMessage::new("Ping", Vec::new()).with_property("destination", "b"))
            .await
            .unwrap();

        assert_eq!(bus.queue_len(TOPIC, "a"), 2);
        assert_eq!(bus.queue_len(TOPIC, "b"), 1);
    }

    #[tokio::test]
    async fn test_receive_and_complete() {
        let (bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();

        sender.send(BusMessage::new("Ping", vec![7u8])).await.unwrap();

        let received = receiver
            .receive(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("message");
        assert_eq!(received.delivery_count, 1);
        assert_eq!(received.message.body.as_ref(), &[7]);

        receiver.complete(&received).await.unwrap();
        assert_eq!(bus.queue_len(TOPIC, "a"), 0);

        let err = receiver.complete(&received).await.unwrap_err();
        assert!(matches!(err, BusError::LockLost(_)));
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        tokio::time::pause();
        let (_bus, client) = setup(&["a"]).await;
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();

        let received = receiver.receive(Duration::from_secs(10)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let (_bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();

        let waiter = tokio::spawn(async move { receiver.receive(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        sender.send(BusMessage::new("Ping", Vec::new())).await.unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert!(received.is_some());
    }

    #[tokio::test]
    async fn test_abandon_redelivers_then_dead_letters() {
        let (bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();
        sender.send(BusMessage::new("Poison", Vec::new())).await.unwrap();

        let first = receiver.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        receiver.abandon(&first).await.unwrap();

        let second = receiver.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(second.delivery_count, 2);
        receiver.abandon(&second).await.unwrap();

        assert_eq!(bus.queue_len(TOPIC, "a"), 0);
        let dead = bus.dead_letters(TOPIC, "a");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, MAX_DELIVERY_EXCEEDED);
    }

    #[tokio::test]
    async fn test_expired_lock_is_redelivered() {
        tokio::time::pause();
        let (_bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();
        sender.send(BusMessage::new("Ping", Vec::new())).await.unwrap();

        let first = receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let again = receiver.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.message.message_id, first.message.message_id);
        assert_eq!(again.delivery_count, 2);
    }

    #[tokio::test]
    async fn test_expired_message_is_dropped() {
        tokio::time::pause();
        let (_bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();
        sender
            .send(BusMessage::new("Ping", Vec::new()).with_time_to_live(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let received = receiver.receive(Duration::from_millis(10)).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_dead_letter_records_reason() {
        let (bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();
        sender.send(BusMessage::new("Ping", Vec::new())).await.unwrap();

        let received = receiver.receive(Duration::from_millis(50)).await.unwrap().unwrap();
        receiver.dead_letter(&received, "bad body").await.unwrap();

        let dead = bus.dead_letters(TOPIC, "a");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "bad body");
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let (bus, client) = setup(&["a"]).await;
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();

        bus.fail_next_receives(1);
        let err = receiver.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BusError::Transient(_)));
        assert!(receiver.receive(Duration::from_millis(10)).await.is_ok());

        bus.fail_next_admin(1, BusError::Transient("throttled".into()));
        assert!(client.topic_exists(TOPIC).await.is_err());
        assert!(client.topic_exists(TOPIC).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let (_bus, client) = setup(&["a"]).await;
        let sender = client.create_sender(TOPIC).await.unwrap();
        client.close().await;

        let err = sender.send(BusMessage::new("Ping", Vec::new())).await.unwrap_err();
        assert_eq!(err, BusError::Closed);
    }

    #[tokio::test]
    async fn test_deleted_subscription_fails_receive() {
        let (_bus, client) = setup(&["a"]).await;
        let receiver = client.create_receiver(TOPIC, "a").await.unwrap();
        client.delete_subscription(TOPIC, "a").await.unwrap();

        let err = receiver.receive(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, BusError::EntityNotFound(_)));
    }

    #[tokio::test]
    async fn test_connect_counts_connections() {
        let bus = InMemoryMessageBus::new();
        assert!(bus.connect("").await.is_err());
        bus.connect("memory://local").await.unwrap();
        bus.connect("memory://local").await.unwrap();
        assert_eq!(bus.connection_count(), 2);
    }
}
