//! # Dataset Router
//!
//! Consumes the global topic in ordered mode and republishes each fresh event
//! to its per-dataset topic through the shared producer pool.
//!
//! - Stale events (older than `staleness_threshold_minutes`) are acked, never forwarded
//! - Fan-out bounded by `max_fanout_concurrency`
//! - Sends to the same dataset topic are chained, different datasets overlap
//! - Publish failure handling follows [`AckPolicy`](contracts::AckPolicy)

mod error;
mod metrics;
mod router;

pub use error::{Result, RouterError};
pub use metrics::{RouterMetrics, RouterStats};
pub use router::{DatasetRouter, RouterHandle};
