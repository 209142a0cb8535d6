//! # Batch Ingestion Engine
//!
//! Drains source topics into a [`StorageSink`](contracts::StorageSink) in
//! count/time bounded windows.
//!
//! Responsibilities:
//! - Competing-consumer subscription of the source topics
//! - Bounded ingress buffer with overflow rejection (nack + backoff)
//! - Windowing (flush on `max_window_size` or `flush_interval`)
//! - Batch persistence, per-record DLQ republish, batched acknowledgment
//!
//! ## Usage Example
//!
//! ```ignore
//! use ingestion::IngestionEngine;
//!
//! let engine = IngestionEngine::new(config.ingest.clone(), subscriptions, pool, store);
//! let handle = engine.spawn(shutdown.clone()).await?;
//!
//! // 健康检查
//! handle.check_health()?;
//!
//! shutdown.cancel();
//! handle.join().await?;
//! ```

mod engine;
mod error;
mod metrics;
mod window;

// Re-exports
pub use engine::{IngestionEngine, IngestionHandle};
pub use error::{IngestError, Result};
pub use metrics::{IngestMetrics, IngestStats};
pub use window::{run_windowing, Admitted, FlushedWindow, Window};
