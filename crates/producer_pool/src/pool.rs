//! ProducerPool implementation
//!
//! Backed by `moka::future::Cache`:
//! - `max_capacity` + `time_to_idle`, LRU eviction
//! - `entry_by_ref().or_try_insert_with()` coalesces concurrent creations
//! - eviction listener hands the evicted producer to a [`TaskTracker`]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contracts::{BrokerClient, ContractError, Producer, ProducerKey, ProducerPoolConfig};
use moka::future::Cache;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use tokio::runtime::Handle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::{PoolError, Result};

/// Pool counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Producers created through the pool
    pub created: u64,
    /// Entries removed by capacity or idle TTL
    pub evicted: u64,
    /// Entries removed by `shutdown`
    pub invalidated: u64,
    /// Successful closes of removed producers
    pub closed: u64,
    /// Closes that returned an error
    pub close_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    evicted: AtomicU64,
    invalidated: AtomicU64,
    closed: AtomicU64,
    close_failures: AtomicU64,
}

/// Keyed producer cache shared by every fan-out task
///
/// Must be constructed inside a Tokio runtime: evicted producers are closed on
/// tasks spawned onto the runtime that created the pool.
pub struct ProducerPool<B: BrokerClient> {
    broker: B,
    cache: Cache<ProducerKey, Arc<B::Producer>>,
    tracker: TaskTracker,
    counters: Arc<Counters>,
    shut_down: AtomicBool,
}

impl<B: BrokerClient> ProducerPool<B> {
    /// Create a pool bounded by `config.max_size` and `config.idle_ttl()`
    pub fn new(broker: B, config: &ProducerPoolConfig) -> Self {
        Self::with_limits(broker, config.max_size, config.idle_ttl())
    }

    /// Create a pool with explicit bounds
    pub fn with_limits(broker: B, max_size: u64, idle_ttl: Duration) -> Self {
        let tracker = TaskTracker::new();
        let counters = Arc::new(Counters::default());

        let listener = {
            let tracker = tracker.clone();
            let runtime = Handle::current();
            let counters = Arc::clone(&counters);
            move |key: Arc<ProducerKey>, producer: Arc<B::Producer>, cause: RemovalCause| {
                if cause.was_evicted() {
                    counters.evicted.fetch_add(1, Ordering::Relaxed);
                    observability::record_pool_event("evicted");
                } else {
                    counters.invalidated.fetch_add(1, Ordering::Relaxed);
                }
                debug!(topic = %key.topic, ?cause, "producer removed from pool");
                tracker.spawn_on(
                    close_removed(key, producer, Arc::clone(&counters)),
                    &runtime,
                );
            }
        };

        let cache = Cache::builder()
            .name("producer_pool")
            .max_capacity(max_size)
            .time_to_idle(idle_ttl)
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(listener)
            .build();

        Self {
            broker,
            cache,
            tracker,
            counters,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Get the live producer for `key`, creating it on a miss
    ///
    /// Concurrent calls for one key share a single creation and its result.
    ///
    /// # Errors
    /// - [`PoolError::Creation`] when the broker rejects the open (not cached)
    /// - [`PoolError::ShutDown`] after [`shutdown`](Self::shutdown)
    #[instrument(name = "producer_pool_get", skip(self, key), fields(topic = %key.topic))]
    pub async fn get(&self, key: &ProducerKey) -> Result<Arc<B::Producer>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(PoolError::ShutDown);
        }

        let entry = self
            .cache
            .entry_by_ref(key)
            .or_try_insert_with(self.create(key))
            .await
            .map_err(|source| PoolError::Creation {
                topic: key.topic.clone(),
                source,
            })?;

        if self.shut_down.load(Ordering::Acquire) {
            // shutdown 的清扫可能错过了这个刚写入的条目
            self.cache.invalidate(key).await;
            self.cache.run_pending_tasks().await;
            self.tracker.wait().await;
            return Err(PoolError::ShutDown);
        }

        if entry.is_fresh() {
            // 新条目写入后立即维护，容量淘汰不依赖后续访问
            self.cache.run_pending_tasks().await;
            observability::record_pool_size(self.cache.entry_count());
        }
        Ok(entry.into_value())
    }

    async fn create(&self, key: &ProducerKey) -> std::result::Result<Arc<B::Producer>, ContractError> {
        let producer = self.broker.create_producer(key).await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        observability::record_pool_event("created");
        debug!(topic = %key.topic, "producer created");
        Ok(Arc::new(producer))
    }

    /// Live entries (exact after [`run_pending_tasks`](Self::run_pending_tasks))
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply pending evictions and expirations now
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            invalidated: self.counters.invalidated.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            close_failures: self.counters.close_failures.load(Ordering::Relaxed),
        }
    }

    /// Close every pooled producer and wait for all closes to finish
    ///
    /// Later `get` calls fail with [`PoolError::ShutDown`].
    #[instrument(name = "producer_pool_shutdown", skip(self))]
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<Arc<ProducerKey>> = self.cache.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.cache.invalidate(key.as_ref()).await;
        }
        self.cache.run_pending_tasks().await;

        self.tracker.close();
        self.tracker.wait().await;

        let stats = self.stats();
        info!(
            created = stats.created,
            evicted = stats.evicted,
            closed = stats.closed,
            close_failures = stats.close_failures,
            "producer pool shut down"
        );
    }
}

async fn close_removed<P: Producer>(key: Arc<ProducerKey>, producer: Arc<P>, counters: Arc<Counters>) {
    match producer.close().await {
        Ok(()) => {
            counters.closed.fetch_add(1, Ordering::Relaxed);
            observability::record_pool_event("closed");
        }
        Err(e) => {
            counters.close_failures.fetch_add(1, Ordering::Relaxed);
            observability::record_pool_event("close_failed");
            warn!(topic = %key.topic, error = %e, "failed to close removed producer");
        }
    }
}
