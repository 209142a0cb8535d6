//! Ingestion metrics

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use observability::{FlushTrigger, MetricsSummary, WindowMetricsAggregator};
use parking_lot::Mutex;

/// Engine counters, shared by every ingestion task
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Messages returned by `receive()`
    received: AtomicU64,

    /// Messages accepted into the ingress buffer
    admitted: AtomicU64,

    /// Messages rejected because the ingress buffer was full
    overflow: AtomicU64,

    /// Current ingress buffer length
    ingress_len: AtomicUsize,

    /// Flushed windows
    windows: AtomicU64,

    /// Records confirmed by storage
    persisted: AtomicU64,

    /// Records that could not be decoded
    decode_failures: AtomicU64,

    /// Records sent to the DLQ path (attempted)
    dlq_attempted: AtomicU64,

    /// DLQ publishes that failed
    dlq_failures: AtomicU64,

    /// Messages acknowledged
    acked: AtomicU64,

    /// Messages whose acknowledgment failed
    ack_failures: AtomicU64,

    /// Per-window size/latency aggregation
    windows_summary: Mutex<WindowMetricsAggregator>,
}

impl IngestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_ingress_len(&self, len: usize) {
        self.ingress_len.store(len, Ordering::Relaxed);
    }

    pub fn record_window(&self, persisted: usize, decode_failures: usize, dlq_attempted: usize) {
        self.windows.fetch_add(1, Ordering::Relaxed);
        self.persisted.fetch_add(persisted as u64, Ordering::Relaxed);
        self.decode_failures
            .fetch_add(decode_failures as u64, Ordering::Relaxed);
        self.dlq_attempted
            .fetch_add(dlq_attempted as u64, Ordering::Relaxed);
    }

    pub fn record_dlq_failure(&self) {
        self.dlq_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acked(&self, count: usize) {
        self.acked.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_ack_failures(&self, count: usize) {
        self.ack_failures.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Feed one persisted window into the summary aggregator
    pub fn record_window_summary(
        &self,
        size: usize,
        trigger: FlushTrigger,
        persisted: usize,
        dlq: usize,
        latency_ms: f64,
    ) {
        self.windows_summary
            .lock()
            .update(size, trigger, persisted, dlq, latency_ms);
    }

    pub fn window_summary(&self) -> MetricsSummary {
        self.windows_summary.lock().summary()
    }

    /// Get snapshot
    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            overflow: self.overflow.load(Ordering::Relaxed),
            ingress_len: self.ingress_len.load(Ordering::Relaxed),
            windows: self.windows.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            dlq_attempted: self.dlq_attempted.load(Ordering::Relaxed),
            dlq_failures: self.dlq_failures.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub admitted: u64,
    pub overflow: u64,
    pub ingress_len: usize,
    pub windows: u64,
    pub persisted: u64,
    pub decode_failures: u64,
    pub dlq_attempted: u64,
    pub dlq_failures: u64,
    pub acked: u64,
    pub ack_failures: u64,
}

impl IngestStats {
    /// Records that left the engine through storage or the DLQ path
    pub fn processed(&self) -> u64 {
        self.persisted + self.dlq_attempted
    }
}
