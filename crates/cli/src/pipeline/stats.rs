//! Platform statistics and summary.

use std::time::Duration;

use ingestion::IngestStats;
use observability::MetricsSummary;
use producer_pool::PoolStats;
use router::RouterStats;

use super::LoadReport;

/// Statistics from a platform run
#[derive(Debug, Clone, Default)]
pub struct PlatformStats {
    /// Why the run ended
    pub stop_reason: String,

    /// Total duration of the run
    pub duration: Duration,

    pub ingest: Option<IngestStats>,

    /// Per-window aggregation of the ingestion engine
    pub windows: Option<MetricsSummary>,

    pub router: Option<RouterStats>,

    pub pool: PoolStats,

    /// Synthetic load outcome (if any)
    pub load: Option<LoadReport>,
}

impl PlatformStats {
    /// Ingested records per second
    pub fn ingest_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        match &self.ingest {
            Some(stats) if secs > 0.0 => stats.processed() as f64 / secs,
            _ => 0.0,
        }
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n=== Telemetry Plane Statistics ===\n");
        println!("Overview");
        println!("   Stop reason: {}", self.stop_reason);
        println!("   Duration: {:.2}s", self.duration.as_secs_f64());
        println!("   Ingest rate: {:.2} records/s", self.ingest_rate());

        if let Some(load) = &self.load {
            println!("\nSynthetic load");
            println!("   Published to sources: {}", load.ingest_published);
            println!("   Published to global: {}", load.global_published);
            println!("   Malformed: {}", load.malformed);
            println!("   Failed: {}", load.failed);
        }

        if let Some(ingest) = &self.ingest {
            println!("\nIngestion");
            println!("   Received: {}", ingest.received);
            println!("   Overflow rejections: {}", ingest.overflow);
            println!("   Persisted: {}", ingest.persisted);
            println!(
                "   DLQ: {} ({} undecodable, {} publish failures)",
                ingest.dlq_attempted, ingest.decode_failures, ingest.dlq_failures
            );
            println!(
                "   Acked: {} ({} ack failures)",
                ingest.acked, ingest.ack_failures
            );
        }

        if let Some(windows) = &self.windows {
            println!("\n{}", windows);
        }

        if let Some(router) = &self.router {
            println!("\nRouter");
            println!("   Incoming: {}", router.incoming);
            println!("   Forwarded: {}", router.outgoing);
            println!("   Stale: {}", router.stale);
            println!("   Malformed: {}", router.malformed);
            println!("   Failed: {}", router.failed);
        }

        println!("\nProducer pool");
        println!("   Created: {}", self.pool.created);
        println!("   Evicted: {}", self.pool.evicted);
        println!("   Closed: {}", self.pool.closed);
        if self.pool.close_failures > 0 {
            println!("   Close failures: {}", self.pool.close_failures);
        }

        println!();
    }
}
