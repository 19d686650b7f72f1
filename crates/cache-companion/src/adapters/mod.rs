//! # Adapters
//!
//! Default implementations of the outbound ports.

pub mod json_serializer;
pub mod memory_store;

pub use json_serializer::JsonValueSerializer;
pub use memory_store::MemoryCacheStore;
