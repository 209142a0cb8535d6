//! MemoryStore - in-process idempotent store

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use contracts::{StorageError, StorageSink, TelemetryEvent, WriteResult};
use parking_lot::RwLock;
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct Inner {
    /// event_id -> event
    events: RwLock<HashMap<String, TelemetryEvent>>,
    available: AtomicBool,
    ingest_calls: AtomicU64,
    duplicates: AtomicU64,
}

/// In-memory store (cheaply cloneable, clones share data)
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let inner = Inner::default();
        inner.available.store(true, Ordering::Release);
        Self {
            name: name.into(),
            inner: Arc::new(inner),
        }
    }

    /// Make every subsequent `ingest` fail at batch level (or recover)
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Release);
    }

    /// Stored records
    pub fn count(&self) -> usize {
        self.inner.events.read().len()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.inner.events.read().contains_key(event_id)
    }

    pub fn get(&self, event_id: &str) -> Option<TelemetryEvent> {
        self.inner.events.read().get(event_id).cloned()
    }

    /// Records of one dataset, by timestamp
    pub fn events_for(&self, dataset_id: &str) -> Vec<TelemetryEvent> {
        let mut events: Vec<_> = self
            .inner
            .events
            .read()
            .values()
            .filter(|e| e.dataset_id == dataset_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        events
    }

    /// Number of `ingest` calls received
    pub fn ingest_calls(&self) -> u64 {
        self.inner.ingest_calls.load(Ordering::Relaxed)
    }

    /// Records already present when ingested again
    pub fn duplicates(&self) -> u64 {
        self.inner.duplicates.load(Ordering::Relaxed)
    }
}

impl StorageSink for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(
        name = "memory_store_ingest",
        skip(self, events),
        fields(store = %self.name, events = events.len())
    )]
    async fn ingest(&self, events: Vec<TelemetryEvent>) -> Result<Vec<WriteResult>, StorageError> {
        self.inner.ingest_calls.fetch_add(1, Ordering::Relaxed);
        if !self.inner.available.load(Ordering::Acquire) {
            return Err(StorageError::unavailable(&self.name, "store is offline"));
        }

        let mut stored = self.inner.events.write();
        let results = events
            .into_iter()
            .map(|event| match event.validate() {
                Ok(()) => {
                    // 以 event_id 为幂等键，重复写入视为成功
                    if stored.contains_key(&event.event_id) {
                        self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
                    } else {
                        stored.insert(event.event_id.clone(), event);
                    }
                    WriteResult::ok()
                }
                Err(reason) => WriteResult::failed(reason),
            })
            .collect::<Vec<_>>();

        debug!(stored = stored.len(), "batch ingested");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::event;

    #[tokio::test]
    async fn test_results_are_positional() {
        let store = MemoryStore::new("mem");
        let results = store
            .ingest(vec![
                event("a", "weather", 1.0),
                event("b", "weather", f64::NAN),
                event("c", "", 3.0),
                event("d", "traffic", 4.0),
            ])
            .await
            .unwrap();

        let flags: Vec<bool> = results.iter().map(|r| r.success).collect();
        assert_eq!(flags, vec![true, false, false, true]);
        assert!(results[1].error.as_deref().unwrap().contains("not finite"));
        assert_eq!(store.count(), 2);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = MemoryStore::new("mem");
        let batch = vec![event("a", "weather", 1.0), event("b", "weather", 2.0)];

        store.ingest(batch.clone()).await.unwrap();
        let again = store.ingest(batch).await.unwrap();

        assert!(again.iter().all(|r| r.success));
        assert_eq!(store.count(), 2);
        assert_eq!(store.duplicates(), 2);
        assert_eq!(store.events_for("weather").len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_is_batch_error() {
        let store = MemoryStore::new("mem");
        store.set_available(false);
        let result = store.ingest(vec![event("a", "weather", 1.0)]).await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
        assert_eq!(store.count(), 0);
    }
}
