//! # Bus Ports
//!
//! Traits a bus backend implements. The companion only talks to these, so a
//! hosted broker and the in-memory bus are interchangeable.
//!
//! ```text
//! BusConnector ──connect()──→ BusClient ──┬── administration (topics, subscriptions, rules)
//!                                          ├── create_sender()   → MessageSender
//!                                          └── create_receiver() → MessageReceiver
//! ```

use crate::error::BusError;
use crate::filter::RuleDescription;
use crate::message::{BusMessage, ReceivedMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Desired properties of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicOptions {
    /// Topic name.
    pub name: String,
    /// Delete the topic after this long without activity.
    pub auto_delete_on_idle: Duration,
    /// Expiry applied to messages that carry no TTL of their own.
    pub default_message_ttl: Duration,
    /// Let the broker batch writes.
    pub enable_batched_operations: bool,
}

/// Desired properties of a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Topic the subscription belongs to.
    pub topic_name: String,
    /// Subscription name.
    pub name: String,
    /// How long a received message stays locked before redelivery.
    pub lock_duration: Duration,
    /// Move expired messages to the dead-letter queue instead of dropping them.
    pub dead_lettering_on_expiration: bool,
    /// Deliveries allowed before the broker dead-letters a message.
    pub max_delivery_count: u32,
    /// Let the broker batch writes.
    pub enable_batched_operations: bool,
}

/// Opens clients for a connection string.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Open a new client. Each call yields an independent connection.
    async fn connect(&self, connection_string: &str) -> Result<Arc<dyn BusClient>, BusError>;
}

/// A live bus connection with administrative rights.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &str) -> Result<bool, BusError>;

    /// Create a topic. Fails with `EntityAlreadyExists` if present.
    async fn create_topic(&self, options: &TopicOptions) -> Result<(), BusError>;

    /// Replace the properties of an existing topic.
    async fn update_topic(&self, options: &TopicOptions) -> Result<(), BusError>;

    /// Whether the subscription exists.
    async fn subscription_exists(&self, topic: &str, subscription: &str) -> Result<bool, BusError>;

    /// Create a subscription. Fails with `EntityAlreadyExists` if present.
    async fn create_subscription(&self, options: &SubscriptionOptions) -> Result<(), BusError>;

    /// Replace the properties of an existing subscription.
    async fn update_subscription(&self, options: &SubscriptionOptions) -> Result<(), BusError>;

    /// Delete a subscription and everything queued in it.
    async fn delete_subscription(&self, topic: &str, subscription: &str) -> Result<(), BusError>;

    /// List the rules of a subscription.
    async fn list_rules(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Vec<RuleDescription>, BusError>;

    /// Add a rule. Fails with `EntityAlreadyExists` if the name is taken.
    async fn create_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &RuleDescription,
    ) -> Result<(), BusError>;

    /// Remove a rule by name.
    async fn delete_rule(&self, topic: &str, subscription: &str, rule: &str)
        -> Result<(), BusError>;

    /// Open a sender publishing to a topic.
    async fn create_sender(&self, topic: &str) -> Result<Arc<dyn MessageSender>, BusError>;

    /// Open a peek-lock receiver on a subscription.
    async fn create_receiver(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Arc<dyn MessageReceiver>, BusError>;

    /// Close the connection. Senders and receivers created from it stop working.
    async fn close(&self);
}

/// Publishes messages to one topic. Safe for concurrent use.
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Publish one message.
    async fn send(&self, message: BusMessage) -> Result<(), BusError>;
}

/// Pulls messages from one subscription under peek-lock.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Wait up to `max_wait` for the next message. `Ok(None)` means the wait elapsed.
    async fn receive(&self, max_wait: Duration) -> Result<Option<ReceivedMessage>, BusError>;

    /// Settle a message as processed; it is removed from the subscription.
    async fn complete(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// Release the lock so the message is delivered again.
    async fn abandon(&self, message: &ReceivedMessage) -> Result<(), BusError>;

    /// Move the message to the dead-letter queue.
    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), BusError>;
}
