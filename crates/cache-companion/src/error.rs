//! # Companion Errors

use crate::chunking::ChunkError;
use shared_bus::BusError;
use thiserror::Error;

/// Invalid configuration. Always fatal at startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// No connection string was given.
    #[error("Connection string is empty")]
    EmptyConnectionString,

    /// No topic name was given.
    #[error("Topic name is empty")]
    EmptyTopicName,

    /// The node id cannot be used as a subscription name.
    #[error("Invalid node id '{0}': expected 1-50 characters of [A-Za-z0-9._-]")]
    InvalidNodeId(String),

    /// Per-request timeout below the one second floor.
    #[error("Request timeout {got_ms}ms is below the minimum of {min_ms}ms")]
    RequestTimeoutTooShort {
        /// Configured timeout
        got_ms: u64,
        /// Minimum allowed
        min_ms: u64,
    },

    /// A size or interval that must be positive was zero.
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    /// An environment variable could not be parsed.
    #[error("Invalid value '{value}' for {var}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
    },
}

/// Companion error types.
#[derive(Debug, Error)]
pub enum CompanionError {
    /// Configuration rejected.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Bus call failed.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Encoding or decoding a body failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A chunk could not be stored.
    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// A message violates the peer protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// No connection became available in time.
    #[error("Timed out waiting for a bus connection")]
    SendTimedOut,

    /// The companion has shut down.
    #[error("Companion stopped")]
    Stopped,
}

impl From<bincode::Error> for CompanionError {
    fn from(err: bincode::Error) -> Self {
        CompanionError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for CompanionError {
    fn from(err: serde_json::Error) -> Self {
        CompanionError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_error() {
        let err = ConfigError::RequestTimeoutTooShort {
            got_ms: 500,
            min_ms: 1000,
        };
        assert!(err.to_string().contains("500ms"));
    }

    #[test]
    fn test_bus_error_converts() {
        let err: CompanionError = BusError::Closed.into();
        assert!(matches!(err, CompanionError::Bus(BusError::Closed)));
    }

    #[test]
    fn test_config_error_converts() {
        let err: CompanionError = ConfigError::EmptyTopicName.into();
        assert!(err.to_string().contains("Topic name"));
    }
}
