//! Router metrics for observability

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Per-router counters
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Messages received from the global topic
    incoming: AtomicU64,
    /// Confirmed publishes to dataset topics
    outgoing: AtomicU64,
    /// Events older than the staleness threshold
    stale: AtomicU64,
    /// Failed publishes (either policy)
    failed: AtomicU64,
    /// Undecodable payloads
    malformed: AtomicU64,
    /// Acknowledgments that were rejected
    ack_failures: AtomicU64,
    /// Current in-flight forward pipelines
    inflight: AtomicUsize,
}

impl RouterMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_incoming(&self) {
        self.incoming.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_outgoing(&self) {
        self.outgoing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ack_failures(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new in-flight count
    pub fn enter(&self) -> usize {
        self.inflight.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns the new in-flight count
    pub fn exit(&self) -> usize {
        self.inflight.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> RouterStats {
        RouterStats {
            incoming: self.incoming.load(Ordering::Relaxed),
            outgoing: self.outgoing.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of router metrics (for reporting)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub incoming: u64,
    pub outgoing: u64,
    pub stale: u64,
    pub failed: u64,
    pub malformed: u64,
    pub ack_failures: u64,
    pub inflight: usize,
}
