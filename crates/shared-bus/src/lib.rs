//! # Shared Bus - Publish/Subscribe Transport
//!
//! Topic/subscription message bus used by cache nodes to talk to each other.
//!
//! ## Model
//!
//! ```text
//! ┌──────────┐   send()   ┌──────────────┐  rules   ┌──────────────────┐
//! │  Sender  │ ─────────→ │    Topic     │ ───────→ │ Subscription (A) │ ──→ receive()
//! └──────────┘            │              │ ───────→ │ Subscription (B) │ ──→ receive()
//!                         └──────────────┘          └──────────────────┘
//! ```
//!
//! - Every node reads from its own subscription.
//! - Server-side rules decide which messages a subscription sees.
//! - Receivers use peek-lock: each message is completed, abandoned or
//!   dead-lettered explicitly.
//!
//! The crate defines the ports (`BusConnector`, `BusClient`, `MessageSender`,
//! `MessageReceiver`) and an in-process implementation, `InMemoryMessageBus`.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod error;
pub mod filter;
pub mod memory;
pub mod message;
pub mod ports;

// Re-export main types
pub use error::BusError;
pub use filter::{RuleDescription, RuleFilter, DEFAULT_RULE_NAME};
pub use memory::{DeadLetter, InMemoryMessageBus, MAX_DELIVERY_EXCEEDED};
pub use message::{BusMessage, PropertyValue, ReceivedMessage};
pub use ports::{
    BusClient, BusConnector, MessageReceiver, MessageSender, SubscriptionOptions, TopicOptions,
};
