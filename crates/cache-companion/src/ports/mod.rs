//! # Ports
//!
//! Interfaces to the owning cache layer.

pub mod outbound;

pub use outbound::{LocalCacheStore, ValueSerializer};
