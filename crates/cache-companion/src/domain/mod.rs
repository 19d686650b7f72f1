//! # Domain
//!
//! Cache-facing value types and the peer wire protocol.

pub mod protocol;
pub mod types;

pub use protocol::{Subject, PEER_RULE_NAME};
pub use types::{
    now_ms, CacheKey, CacheMissDescriptor, CachedValue, GetRequest, InvalidationDescriptor,
};
