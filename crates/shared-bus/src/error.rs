//! # Bus Errors

use thiserror::Error;

/// Errors from bus operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Create was called for an entity that already exists.
    #[error("Messaging entity already exists: {0}")]
    EntityAlreadyExists(String),

    /// The referenced topic, subscription or rule does not exist.
    #[error("Messaging entity not found: {0}")]
    EntityNotFound(String),

    /// Transport hiccup (network, throttling, broker busy).
    #[error("Transient bus failure: {0}")]
    Transient(String),

    /// The client or receiver was closed.
    #[error("Bus connection closed")]
    Closed,

    /// The lock token is unknown or its lock expired.
    #[error("Message lock lost: {0}")]
    LockLost(String),

    /// The request was rejected by the broker.
    #[error("Invalid bus operation: {0}")]
    InvalidOperation(String),
}

impl BusError {
    /// Whether a provisioning call failing with this error is worth retrying.
    ///
    /// Concurrent installers race on create/delete, so "already exists" and
    /// "not found" are expected outcomes rather than faults.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BusError::EntityAlreadyExists(_) | BusError::EntityNotFound(_) | BusError::Transient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BusError::EntityAlreadyExists("t".into()).is_retryable());
        assert!(BusError::EntityNotFound("t".into()).is_retryable());
        assert!(BusError::Transient("reset".into()).is_retryable());
        assert!(!BusError::Closed.is_retryable());
        assert!(!BusError::InvalidOperation("bad".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = BusError::EntityNotFound("cache/node-a".into());
        assert!(err.to_string().contains("cache/node-a"));
    }
}
