//! # Cache Companion - Peer Sync for Distributed In-Process Caches
//!
//! Runs next to a node's local cache and talks to the other nodes over a
//! topic/subscription message bus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        CACHE COMPANION (node)                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  PeerCacheLocation ──GetRequest──→ ┐        ┌──→ EventBroadcaster     │
//! │         ↑                          │        │   (CacheMiss/Invalidate)│
//! │  PendingResponseRegistry           ▼        ▼                         │
//! │         ↑                    BusConnectionHolder ←── TopologyInstaller│
//! │  MessageProcessor ←── ReceiveLoop ←── own subscription               │
//! │         ↓                                                             │
//! │  LocalCacheStore (answers GetRequest, applies misses/invalidations)  │
//! └──────────────────────────────────────────────────────────────────────┘
//!                               │
//!                     Topic "cache-sync"
//!                               │
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!     sub "node-a"         sub "node-b"         sub "node-c"
//! ```
//!
//! Each subscription carries one rule:
//! `source <> self AND (destination IS NULL OR destination = self)`.
//!
//! # Usage
//!
//! ```ignore
//! use cache_companion::{CacheCompanion, CompanionConfig, JsonValueSerializer, MemoryCacheStore};
//!
//! let serializer = Arc::new(JsonValueSerializer);
//! let companion = CacheCompanion::start(config, connector, store, serializer).await?;
//! let outcome = companion.peer("node-b").get(&key, None, || {}, &cancel).await;
//! companion.broadcaster().notify_invalidation(&descriptor).await?;
//! companion.shutdown().await;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod broadcaster;
pub mod chunking;
pub mod companion;
pub mod config;
pub mod connection;
pub mod domain;
pub mod error;
pub mod peer;
pub mod pending;
pub mod ports;
pub mod processor;
pub mod receive_loop;
pub mod retry;
pub mod stats;
pub mod topology;

// Re-export main types
pub use adapters::{JsonValueSerializer, MemoryCacheStore};
pub use broadcaster::EventBroadcaster;
pub use chunking::{
    chunk_count, split_payload, ChunkError, ChunkReassembler, DEFAULT_CHUNK_SIZE, MAX_CHUNK_COUNT,
};
pub use companion::CacheCompanion;
pub use config::CompanionConfig;
pub use connection::{BusConnection, BusConnectionHolder, ConnectionState};
pub use domain::{
    CacheKey, CacheMissDescriptor, CachedValue, GetRequest, InvalidationDescriptor, Subject,
};
pub use error::{CompanionError, ConfigError};
pub use peer::{PeerCacheLocation, PeerGetOutcome, PeerValue};
pub use pending::PendingResponseRegistry;
pub use ports::{LocalCacheStore, ValueSerializer};
pub use processor::{Disposition, MessageProcessor};
pub use receive_loop::{ReceiveLoop, ReceiveLoopHandle};
pub use retry::RetryPolicy;
pub use stats::{CompanionStats, StatsSnapshot};
pub use topology::TopologyInstaller;
