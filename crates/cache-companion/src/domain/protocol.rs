//! # Peer Protocol
//!
//! How companion operations map onto bus messages.
//!
//! | Subject | Destination | Correlation id | Body |
//! |---------|-------------|----------------|------|
//! | `GetRequest` | answering peer | - (message id is the correlation id) | `GetRequest` |
//! | `GetResponse` | requester | request message id | value chunk |
//! | `CacheMiss` | none (broadcast) | - | `CacheMissDescriptor` |
//! | `Invalidate` | none (broadcast) | - | `InvalidationDescriptor` |
//!
//! Every message carries `source`. Response chunks carry `chunkIndex`
//! (1-based) and `chunkCount`; both default to 1 when absent.

use crate::chunking::MAX_CHUNK_COUNT;
use crate::error::CompanionError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared_bus::{BusMessage, RuleFilter};

/// Sending node id.
pub const PROP_SOURCE: &str = "source";
/// Addressed node id; absent for broadcasts.
pub const PROP_DESTINATION: &str = "destination";
/// 1-based position of a response chunk.
pub const PROP_CHUNK_INDEX: &str = "chunkIndex";
/// Total chunks of a response.
pub const PROP_CHUNK_COUNT: &str = "chunkCount";

/// Name of the routing rule installed on every node's subscription.
pub const PEER_RULE_NAME: &str = "peers";

/// The four companion operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    /// Ask one peer for a key.
    GetRequest,
    /// One chunk of a peer's answer.
    GetResponse,
    /// A peer missed a key.
    CacheMiss,
    /// A key changed at its source.
    Invalidate,
}

impl Subject {
    /// Wire label.
    pub fn as_str(self) -> &'static str {
        match self {
            Subject::GetRequest => "GetRequest",
            Subject::GetResponse => "GetResponse",
            Subject::CacheMiss => "CacheMiss",
            Subject::Invalidate => "Invalidate",
        }
    }

    /// Parse a wire label.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "GetRequest" => Some(Subject::GetRequest),
            "GetResponse" => Some(Subject::GetResponse),
            "CacheMiss" => Some(Subject::CacheMiss),
            "Invalidate" => Some(Subject::Invalidate),
            _ => None,
        }
    }
}

/// Filter of `node_id`'s subscription:
/// `source <> node AND (destination IS NULL OR destination = node)`.
pub fn routing_filter(node_id: &str) -> RuleFilter {
    RuleFilter::not_equals(PROP_SOURCE, node_id).and(
        RuleFilter::missing(PROP_DESTINATION).or(RuleFilter::equals(PROP_DESTINATION, node_id)),
    )
}

/// Encode a protocol body.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CompanionError> {
    Ok(bincode::serialize(value)?)
}

/// Decode a protocol body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CompanionError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Build a message from `source`, addressed to `destination` or broadcast.
pub fn envelope(
    subject: Subject,
    source: &str,
    destination: Option<&str>,
    body: impl Into<Bytes>,
) -> BusMessage {
    let message = BusMessage::new(subject.as_str(), body).with_property(PROP_SOURCE, source);
    match destination {
        Some(dest) => message.with_property(PROP_DESTINATION, dest),
        None => message,
    }
}

/// Build one response chunk.
pub fn response_chunk(
    source: &str,
    requester: &str,
    correlation_id: &str,
    chunk_index: usize,
    chunk_count: usize,
    body: Bytes,
) -> BusMessage {
    envelope(Subject::GetResponse, source, Some(requester), body)
        .with_correlation_id(correlation_id)
        .with_property(PROP_CHUNK_INDEX, chunk_index as i64)
        .with_property(PROP_CHUNK_COUNT, chunk_count as i64)
}

/// Read `(chunkIndex, chunkCount)`, defaulting each to 1. Counts above
/// [`MAX_CHUNK_COUNT`] are rejected.
pub fn chunk_position(message: &BusMessage) -> Result<(usize, usize), CompanionError> {
    let read = |name: &str| -> Result<usize, CompanionError> {
        match message.properties.get(name) {
            None => Ok(1),
            Some(value) => value
                .as_int()
                .and_then(|v| usize::try_from(v).ok())
                .filter(|v| *v >= 1)
                .ok_or_else(|| CompanionError::Protocol(format!("invalid {name}: {value}"))),
        }
    };

    let index = read(PROP_CHUNK_INDEX)?;
    let count = read(PROP_CHUNK_COUNT)?;
    if count > MAX_CHUNK_COUNT {
        return Err(CompanionError::Protocol(format!(
            "chunk count {count} exceeds the limit of {MAX_CHUNK_COUNT}"
        )));
    }
    if index > count {
        return Err(CompanionError::Protocol(format!(
            "chunk index {index} exceeds chunk count {count}"
        )));
    }
    Ok((index, count))
}
