//! StorageSink trait - columnar store ingest interface
//!
//! Only the `ingest(events) -> WriteResult[]` contract of the store matters to
//! the data-plane; its query layer lives elsewhere.

use thiserror::Error;

use crate::TelemetryEvent;

/// Outcome of one event, positionally aligned with the ingested batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub success: bool,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Batch-level storage failure, not attributable to individual records
#[derive(Debug, Error)]
pub enum StorageError {
    /// Store unreachable or refusing writes
    #[error("storage '{store}' unavailable: {message}")]
    Unavailable { store: String, message: String },

    /// Store answered but broke the positional contract
    #[error("storage '{store}' returned {got} results for {expected} events")]
    ResultMismatch {
        store: String,
        expected: usize,
        got: usize,
    },
}

impl StorageError {
    pub fn unavailable(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            store: store.into(),
            message: message.into(),
        }
    }
}

/// Columnar store write interface
///
/// Implementations must return exactly one [`WriteResult`] per event, in order.
/// Record-level problems are reported in the results; `Err` means the whole
/// batch could not be attempted.
#[trait_variant::make(StorageSink: Send)]
pub trait LocalStorageSink {
    /// Store name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Write a batch of events
    ///
    /// # Errors
    /// Returns [`StorageError`] when the batch could not be attempted at all
    async fn ingest(&self, events: Vec<TelemetryEvent>) -> Result<Vec<WriteResult>, StorageError>;
}
