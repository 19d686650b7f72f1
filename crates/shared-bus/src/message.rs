//! # Bus Messages
//!
//! The envelope carried by the bus. A message has a subject, an optional
//! correlation id, a bag of application properties (used by routing rules)
//! and an opaque binary body.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Value of an application property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// UTF-8 string property.
    String(String),
    /// Signed integer property.
    Int(i64),
}

impl PropertyValue {
    /// Borrow the value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            PropertyValue::Int(_) => None,
        }
    }

    /// Get the value as an integer, if it is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v),
            PropertyValue::String(_) => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::String(s) => write!(f, "'{s}'"),
            PropertyValue::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

/// A message as published to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Unique id assigned by the sender.
    pub message_id: String,
    /// Application-defined label.
    pub subject: String,
    /// Id linking a reply to the request it answers.
    pub correlation_id: Option<String>,
    /// Application properties evaluated by subscription rules.
    pub properties: HashMap<String, PropertyValue>,
    /// Opaque payload.
    pub body: Bytes,
    /// Per-message expiry; falls back to the topic default when `None`.
    pub time_to_live: Option<Duration>,
}

impl BusMessage {
    /// Create a message with a fresh random id.
    #[must_use]
    pub fn new(subject: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            correlation_id: None,
            properties: HashMap::new(),
            body: body.into(),
            time_to_live: None,
        }
    }

    /// Override the message id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set an application property.
    #[must_use]
    pub fn with_property(
        mut self,
        name: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Set a per-message time to live.
    #[must_use]
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Look up a string property.
    #[must_use]
    pub fn string_property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(PropertyValue::as_str)
    }

    /// Look up an integer property.
    #[must_use]
    pub fn int_property(&self, name: &str) -> Option<i64> {
        self.properties.get(name).and_then(PropertyValue::as_int)
    }
}

/// A message handed out by a receiver under a peek-lock.
///
/// The lock token must be passed back to the receiver to settle the message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// The delivered envelope.
    pub message: BusMessage,
    /// Token identifying this delivery's lock.
    pub lock_token: Uuid,
    /// Number of times the message has been delivered, starting at 1.
    pub delivery_count: u32,
}
