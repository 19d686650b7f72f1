//! Companion counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Running totals for one companion.
#[derive(Debug, Default)]
pub struct CompanionStats {
    /// Get-requests sent to peers
    pub requests_sent: AtomicU64,
    /// Peer requests answered with a usable value
    pub answers_found: AtomicU64,
    /// Peer requests answered with nothing usable
    pub answers_missing: AtomicU64,
    /// Peer requests with no complete answer in time
    pub timeouts: AtomicU64,
    /// Inbound messages settled as completed
    pub messages_processed: AtomicU64,
    /// Inbound messages moved to the dead-letter queue
    pub messages_dead_lettered: AtomicU64,
    /// Inbound messages handed back to the bus
    pub messages_abandoned: AtomicU64,
    /// Connections re-established after a failure
    pub reconnects: AtomicU64,
}

/// Point-in-time copy of [`CompanionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Get-requests sent to peers
    pub requests_sent: u64,
    /// Peer requests answered with a usable value
    pub answers_found: u64,
    /// Peer requests answered with nothing usable
    pub answers_missing: u64,
    /// Peer requests with no complete answer in time
    pub timeouts: u64,
    /// Inbound messages settled as completed
    pub messages_processed: u64,
    /// Inbound messages moved to the dead-letter queue
    pub messages_dead_lettered: u64,
    /// Inbound messages handed back to the bus
    pub messages_abandoned: u64,
    /// Connections re-established after a failure
    pub reconnects: u64,
}

impl CompanionStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            answers_found: self.answers_found.load(Ordering::Relaxed),
            answers_missing: self.answers_missing.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            messages_abandoned: self.messages_abandoned.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = CompanionStats::default();
        CompanionStats::incr(&stats.requests_sent);
        CompanionStats::incr(&stats.requests_sent);
        CompanionStats::incr(&stats.timeouts);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_sent, 2);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.answers_found, 0);
    }
}
