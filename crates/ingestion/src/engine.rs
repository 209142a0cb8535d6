//! Batch Ingestion Engine main entry
//!
//! ```text
//! consumer[0..n] ──receive──▶ ingress (async_channel, bounded)
//!                                  │
//!                             windowing task
//!                                  │ persist queue (mpsc, bounded)
//!                             persist task ──▶ StorageSink::ingest
//!                                  ├──▶ DLQ (ProducerPool)
//!                                  └──▶ acknowledge_many per consumer
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_channel::{bounded, Sender, TrySendError};
use contracts::{
    BrokerClient, ContentType, Consumer, ContractError, IngestConfig, Message, MessageId,
    Producer, ProducerKey, StorageError, StorageSink, SubscriptionMode, TelemetryEvent,
};
use observability::MetricsSummary;
use producer_pool::ProducerPool;
use subscription::SubscriptionManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{IngestError, Result};
use crate::metrics::{IngestMetrics, IngestStats};
use crate::window::{run_windowing, Admitted, FlushedWindow};

/// Batch Ingestion Engine
///
/// Built once, started with [`spawn`](Self::spawn).
pub struct IngestionEngine<B: BrokerClient, S> {
    config: IngestConfig,
    subscriptions: Arc<SubscriptionManager<B>>,
    pool: Arc<ProducerPool<B>>,
    store: Arc<S>,
    metrics: Arc<IngestMetrics>,
}

impl<B, S> IngestionEngine<B, S>
where
    B: BrokerClient,
    S: StorageSink + Sync + 'static,
{
    pub fn new(
        config: IngestConfig,
        subscriptions: Arc<SubscriptionManager<B>>,
        pool: Arc<ProducerPool<B>>,
        store: Arc<S>,
    ) -> Self {
        Self {
            config,
            subscriptions,
            pool,
            store,
            metrics: Arc::new(IngestMetrics::new()),
        }
    }

    /// Shared metrics
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: &str| IngestError::InvalidConfig {
            message: message.to_string(),
        };
        if self.config.source_topics.is_empty() {
            return Err(invalid("no source topics"));
        }
        if self.config.consumer_count == 0 {
            return Err(invalid("consumer_count must be > 0"));
        }
        if self.config.max_window_size == 0 {
            return Err(invalid("max_window_size must be > 0"));
        }
        if self.config.source_topics.contains(&self.config.dlq_topic) {
            return Err(invalid("dlq_topic must not be a source topic"));
        }
        Ok(())
    }

    /// Subscribe the source topics and start every ingestion task
    ///
    /// Cancelling `shutdown` stops the receive loops; the partial window is
    /// flushed and persisted before the engine finishes.
    ///
    /// # Errors
    /// Subscription failure is returned as-is (fatal to the caller).
    #[instrument(
        name = "ingest_engine_spawn",
        skip_all,
        fields(
            subscription = %self.config.subscription_name,
            consumers = self.config.consumer_count
        )
    )]
    pub async fn spawn(self, shutdown: CancellationToken) -> Result<IngestionHandle> {
        self.validate()?;

        let mut consumers = Vec::with_capacity(self.config.consumer_count);
        for _ in 0..self.config.consumer_count {
            let subscribed = self
                .subscriptions
                .subscribe(
                    &self.config.source_topics,
                    &self.config.subscription_name,
                    ContentType::Json,
                    SubscriptionMode::Competing,
                )
                .await;
            match subscribed {
                Ok(consumer) => consumers.push(consumer),
                Err(e) => {
                    close_consumers(&consumers).await;
                    return Err(e.into());
                }
            }
        }

        let token = shutdown.child_token();
        let (ingress_tx, ingress_rx) = bounded(self.config.ingress_capacity());
        let (persist_tx, persist_rx) = mpsc::channel(self.config.persist_queue_depth.max(1));
        let failure = Arc::new(OnceLock::new());

        let receivers: Vec<JoinHandle<()>> = consumers
            .iter()
            .enumerate()
            .map(|(index, consumer)| {
                tokio::spawn(receive_loop(
                    index,
                    Arc::clone(consumer),
                    ingress_tx.clone(),
                    Arc::clone(&self.metrics),
                    self.config.overflow_backoff(),
                    token.clone(),
                ))
            })
            .collect();
        // receive loop 持有全部 sender，全部退出后 ingress 关闭
        drop(ingress_tx);

        let windowing = tokio::spawn(run_windowing(
            ingress_rx,
            persist_tx,
            self.config.max_window_size,
            self.config.flush_interval(),
        ));

        let stage = PersistStage::<B, S> {
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
            consumers: consumers.clone(),
            dlq_key: ProducerKey::new(&self.config.dlq_topic).with_content_type(ContentType::Binary),
            metrics: Arc::clone(&self.metrics),
        };
        let persist = tokio::spawn(async move { stage.run(persist_rx).await });

        info!(
            topics = ?self.config.source_topics,
            ingress_capacity = self.config.ingress_capacity(),
            "ingestion engine started"
        );

        let task = tokio::spawn(supervise(
            persist,
            windowing,
            receivers,
            consumers,
            token.clone(),
            Arc::clone(&failure),
            Arc::clone(&self.metrics),
        ));

        Ok(IngestionHandle {
            token,
            task,
            metrics: self.metrics,
            failure,
        })
    }
}

/// Handle to a running engine
pub struct IngestionHandle {
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
    metrics: Arc<IngestMetrics>,
    failure: Arc<OnceLock<String>>,
}

impl IngestionHandle {
    /// `Err` once the engine stopped on its own
    pub fn check_health(&self) -> Result<()> {
        if let Some(reason) = self.failure.get() {
            return Err(IngestError::Unhealthy {
                reason: reason.clone(),
            });
        }
        if self.task.is_finished() && !self.token.is_cancelled() {
            return Err(IngestError::Unhealthy {
                reason: "engine stopped unexpectedly".to_string(),
            });
        }
        Ok(())
    }

    pub fn stats(&self) -> IngestStats {
        self.metrics.snapshot()
    }

    pub fn window_summary(&self) -> MetricsSummary {
        self.metrics.window_summary()
    }

    /// Shared counters, still readable after [`join`](Self::join)
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Request a graceful stop (same as cancelling the parent token)
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the engine to finish draining
    ///
    /// # Errors
    /// [`IngestError::StorageFatal`] if storage failed at batch level.
    pub async fn join(self) -> Result<()> {
        self.task
            .await
            .map_err(|e| IngestError::task_failed("ingest_supervisor", e.to_string()))?
    }
}

async fn supervise<C: Consumer>(
    persist: JoinHandle<Result<()>>,
    windowing: JoinHandle<()>,
    receivers: Vec<JoinHandle<()>>,
    consumers: Vec<Arc<C>>,
    token: CancellationToken,
    failure: Arc<OnceLock<String>>,
    metrics: Arc<IngestMetrics>,
) -> Result<()> {
    let result = match persist.await {
        Ok(result) => result,
        Err(e) => Err(IngestError::task_failed("ingest_persist", e.to_string())),
    };

    if let Err(e) = &result {
        error!(error = %e, "ingestion engine failed, stopping");
        let _ = failure.set(e.to_string());
        token.cancel();
    }

    if let Err(e) = windowing.await {
        warn!(error = %e, "windowing task panicked");
    }
    for receiver in receivers {
        if let Err(e) = receiver.await {
            warn!(error = %e, "receive loop panicked");
        }
    }
    close_consumers(&consumers).await;

    let stats = metrics.snapshot();
    info!(
        received = stats.received,
        persisted = stats.persisted,
        dlq = stats.dlq_attempted,
        overflow = stats.overflow,
        acked = stats.acked,
        "ingestion engine stopped"
    );
    result
}

async fn close_consumers<C: Consumer>(consumers: &[Arc<C>]) {
    for consumer in consumers {
        if let Err(e) = consumer.close().await {
            warn!(subscription = consumer.subscription(), error = %e, "consumer close failed");
        }
    }
}

/// Per-handle receive loop feeding the ingress buffer
#[instrument(name = "ingest_receive_loop", skip_all, fields(handle = index))]
async fn receive_loop<C: Consumer>(
    index: usize,
    consumer: Arc<C>,
    ingress: Sender<Admitted>,
    metrics: Arc<IngestMetrics>,
    backoff: Duration,
    shutdown: CancellationToken,
) {
    debug!("receive loop started");
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = consumer.receive() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(ContractError::Closed { .. }) => break,
            Err(e) => {
                warn!(error = %e, "receive failed");
                if pause(backoff, &shutdown).await {
                    break;
                }
                continue;
            }
        };

        metrics.record_received();
        observability::record_message_received("ingest");

        match ingress.try_send(Admitted {
            handle: index,
            message,
        }) {
            Ok(()) => {
                metrics.record_admitted();
                metrics.update_ingress_len(ingress.len());
            }
            Err(TrySendError::Full(rejected)) => {
                metrics.record_overflow();
                observability::record_ingress_overflow();
                debug!(id = %rejected.message.id, "ingress full, message rejected");
                // 拒收的消息交还 broker 重投，不丢失
                if let Err(e) = consumer.negative_acknowledge(&rejected.message.id).await {
                    warn!(id = %rejected.message.id, error = %e, "negative acknowledge failed");
                }
                if pause(backoff, &shutdown).await {
                    break;
                }
            }
            Err(TrySendError::Closed(rejected)) => {
                if let Err(e) = consumer.negative_acknowledge(&rejected.message.id).await {
                    warn!(id = %rejected.message.id, error = %e, "negative acknowledge failed");
                }
                break;
            }
        }
    }
    debug!("receive loop stopped");
}

/// Sleep unless cancelled first; returns true when cancelled
async fn pause(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Persistence, DLQ and acknowledgment of flushed windows
struct PersistStage<B: BrokerClient, S> {
    store: Arc<S>,
    pool: Arc<ProducerPool<B>>,
    consumers: Vec<Arc<B::Consumer>>,
    dlq_key: ProducerKey,
    metrics: Arc<IngestMetrics>,
}

impl<B, S> PersistStage<B, S>
where
    B: BrokerClient,
    S: StorageSink + Sync + 'static,
{
    async fn run(self, mut windows: mpsc::Receiver<FlushedWindow>) -> Result<()> {
        while let Some(window) = windows.recv().await {
            self.persist_window(window).await?;
        }
        Ok(())
    }

    #[instrument(
        name = "ingest_persist_window",
        skip_all,
        fields(seq = window.seq, size = window.entries.len(), trigger = window.trigger.as_str())
    )]
    async fn persist_window(&self, window: FlushedWindow) -> Result<()> {
        let started = Instant::now();
        let size = window.entries.len();

        let mut failed = vec![false; size];
        let mut events = Vec::with_capacity(size);
        let mut positions = Vec::with_capacity(size);
        for (i, entry) in window.entries.iter().enumerate() {
            match TelemetryEvent::decode(&entry.message.content) {
                Ok(event) => {
                    events.push(event);
                    positions.push(i);
                }
                Err(e) => {
                    debug!(id = %entry.message.id, error = %e, "undecodable payload");
                    failed[i] = true;
                }
            }
        }
        let decode_failures = size - events.len();

        if !events.is_empty() {
            let expected = events.len();
            let results = self
                .store
                .ingest(events)
                .await
                .map_err(IngestError::StorageFatal)?;
            if results.len() != expected {
                return Err(IngestError::StorageFatal(StorageError::ResultMismatch {
                    store: self.store.name().to_string(),
                    expected,
                    got: results.len(),
                }));
            }
            for (result, &i) in results.iter().zip(&positions) {
                if !result.success {
                    debug!(
                        id = %window.entries[i].message.id,
                        reason = result.error.as_deref().unwrap_or("unknown"),
                        "record rejected by storage"
                    );
                    failed[i] = true;
                }
            }
        }

        let dlq_attempted = failed.iter().filter(|f| **f).count();
        let persisted = size - dlq_attempted;
        for (entry, _) in window.entries.iter().zip(&failed).filter(|(_, f)| **f) {
            self.publish_dead_letter(&entry.message).await;
        }

        self.acknowledge(&window.entries).await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .record_window(persisted, decode_failures, dlq_attempted);
        observability::record_window_persisted(persisted, dlq_attempted, latency_ms);
        self.metrics
            .record_window_summary(size, window.trigger, persisted, dlq_attempted, latency_ms);

        debug!(persisted, dlq_attempted, latency_ms, "window done");
        Ok(())
    }

    /// Republish the original payload to the DLQ; failures are counted only
    async fn publish_dead_letter(&self, message: &Message) {
        let sent = match self.pool.get(&self.dlq_key).await {
            Ok(producer) => producer
                .send(message.content.clone())
                .await
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match sent {
            Ok(()) => observability::record_dlq_publish(true),
            Err(e) => {
                self.metrics.record_dlq_failure();
                observability::record_dlq_publish(false);
                warn!(id = %message.id, dlq = %self.dlq_key.topic, error = %e, "DLQ publish failed");
            }
        }
    }

    /// One batched acknowledgment per originating consumer handle
    async fn acknowledge(&self, entries: &[Admitted]) {
        let mut groups: BTreeMap<usize, Vec<MessageId>> = BTreeMap::new();
        for entry in entries {
            groups
                .entry(entry.handle)
                .or_default()
                .push(entry.message.id.clone());
        }

        for (handle, ids) in groups {
            let Some(consumer) = self.consumers.get(handle) else {
                continue;
            };
            match consumer.acknowledge_many(&ids).await {
                Ok(()) => self.metrics.record_acked(ids.len()),
                Err(e) => {
                    self.metrics.record_ack_failures(ids.len());
                    observability::record_ack_failure("ingest", ids.len());
                    warn!(handle, count = ids.len(), error = %e, "acknowledge failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::InMemoryBroker;
    use bytes::Bytes;
    use chrono::Utc;
    use storage::MemoryStore;
    use subscription::SubscriptionSettings;

    const SOURCE: &str = "telemetry-ingest";
    const SUBSCRIPTION: &str = "telemetry-sink";
    const DLQ: &str = "telemetry-dlq";

    fn config(max_window_size: usize, flush_interval_ms: u64) -> IngestConfig {
        IngestConfig {
            source_topics: vec![SOURCE.to_string()],
            subscription_name: SUBSCRIPTION.to_string(),
            dlq_topic: DLQ.to_string(),
            max_window_size,
            flush_interval_ms,
            overflow_backoff_ms: 5,
            ..IngestConfig::default()
        }
    }

    fn payload(id: &str, dataset: &str) -> Bytes {
        TelemetryEvent {
            event_id: id.to_string(),
            dataset_id: dataset.to_string(),
            source: "sensor-1".to_string(),
            metric: "temperature".to_string(),
            value: 21.5,
            timestamp: Utc::now(),
            tags: Default::default(),
        }
        .encode()
        .unwrap()
    }

    fn engine(
        broker: &InMemoryBroker,
        store: &MemoryStore,
        config: IngestConfig,
    ) -> IngestionEngine<InMemoryBroker, MemoryStore> {
        let subscriptions = Arc::new(SubscriptionManager::new(
            broker.clone(),
            SubscriptionSettings::new("node-1"),
        ));
        let pool = Arc::new(ProducerPool::with_limits(
            broker.clone(),
            100,
            Duration::from_secs(600),
        ));
        IngestionEngine::new(config, subscriptions, pool, Arc::new(store.clone()))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_every_message_persisted_and_acked() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");
        for i in 0..25 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let handle = engine(&broker, &store, config(10, 50))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 25).await;
        assert!(handle.check_health().is_ok());

        handle.shutdown();
        let stats = handle.stats();
        handle.join().await.unwrap();

        assert_eq!(store.count(), 25);
        assert_eq!(stats.persisted, 25);
        assert_eq!(stats.dlq_attempted, 0);
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn test_unwritable_records_go_to_dlq_and_are_acked() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");
        broker.publish(SOURCE, None, payload("a", "weather")).unwrap();
        broker
            .publish(SOURCE, None, Bytes::from_static(b"not json"))
            .unwrap();
        // dataset 为空，存储层逐条拒绝
        broker.publish(SOURCE, None, payload("b", "")).unwrap();
        broker.publish(SOURCE, None, payload("c", "traffic")).unwrap();

        let handle = engine(&broker, &store, config(4, 1000))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 4).await;

        let stats = handle.stats();
        assert_eq!(stats.persisted, 2);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.dlq_attempted, 2);
        assert_eq!(stats.dlq_failures, 0);
        assert_eq!(broker.message_count(DLQ), 2);
        assert!(broker
            .messages(DLQ)
            .contains(&Bytes::from_static(b"not json")));
        assert_eq!(store.count(), 2);

        handle.shutdown();
        handle.join().await.unwrap();
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn test_dlq_failure_still_acks() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");
        broker.fail_publish(DLQ, true);
        broker
            .publish(SOURCE, None, Bytes::from_static(b"{broken"))
            .unwrap();

        let handle = engine(&broker, &store, config(1, 1000))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 1).await;

        assert_eq!(handle.stats().dlq_failures, 1);
        handle.shutdown();
        handle.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_storage_outage_is_fatal_and_leaves_messages_unacked() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");
        store.set_available(false);
        for i in 0..3 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = engine(&broker, &store, config(3, 1000))
            .spawn(shutdown.clone())
            .await
            .unwrap();
        eventually(|| handle.is_finished()).await;

        assert!(matches!(
            handle.check_health(),
            Err(IngestError::Unhealthy { .. })
        ));
        assert_eq!(handle.stats().acked, 0);
        assert!(!shutdown.is_cancelled());

        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, IngestError::StorageFatal(_)));
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 3);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_partial_window() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");
        for i in 0..5 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let handle = engine(&broker, &store, config(100, 60_000))
            .spawn(shutdown.clone())
            .await
            .unwrap();
        eventually(|| handle.stats().admitted == 5).await;
        assert_eq!(store.count(), 0);

        shutdown.cancel();
        eventually(|| handle.is_finished()).await;
        let summary = handle.window_summary();
        handle.join().await.unwrap();

        assert_eq!(store.count(), 5);
        assert_eq!(summary.total_windows, 1);
        assert_eq!(summary.total_persisted, 5);
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 0);
    }

    #[tokio::test]
    async fn test_full_ingress_rejects_and_nacks() {
        let broker = InMemoryBroker::new();
        for i in 0..3 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }
        let subscriptions =
            SubscriptionManager::new(broker.clone(), SubscriptionSettings::new("node-1"));
        let consumer = subscriptions
            .subscribe(
                &[SOURCE.to_string()],
                SUBSCRIPTION,
                ContentType::Json,
                SubscriptionMode::Competing,
            )
            .await
            .unwrap();

        // 容量 1 且无人消费
        let (tx, rx) = bounded(1);
        let metrics = Arc::new(IngestMetrics::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(receive_loop(
            0,
            Arc::clone(&consumer),
            tx,
            Arc::clone(&metrics),
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        eventually(|| metrics.snapshot().overflow >= 2).await;
        shutdown.cancel();
        task.await.unwrap();

        let stats = metrics.snapshot();
        assert_eq!(stats.admitted, 1);
        assert_eq!(rx.len(), 1);
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 3);
    }

    #[tokio::test]
    async fn test_closed_ingress_nacks_and_stops() {
        let broker = InMemoryBroker::new();
        for i in 0..2 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }
        let subscriptions =
            SubscriptionManager::new(broker.clone(), SubscriptionSettings::new("node-1"));
        let consumer = subscriptions
            .subscribe(
                &[SOURCE.to_string()],
                SUBSCRIPTION,
                ContentType::Json,
                SubscriptionMode::Competing,
            )
            .await
            .unwrap();

        // 窗口任务已退出
        let (tx, rx) = bounded(1);
        drop(rx);
        let metrics = Arc::new(IngestMetrics::new());
        receive_loop(
            0,
            Arc::clone(&consumer),
            tx,
            Arc::clone(&metrics),
            Duration::from_millis(5),
            CancellationToken::new(),
        )
        .await;

        let stats = metrics.snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.admitted, 0);
        assert_eq!(broker.backlog(SOURCE, SUBSCRIPTION), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new("memory");

        let mut zero_consumers = config(10, 100);
        zero_consumers.consumer_count = 0;
        let result = engine(&broker, &store, zero_consumers)
            .spawn(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(IngestError::InvalidConfig { .. })));

        let mut dlq_loop = config(10, 100);
        dlq_loop.dlq_topic = SOURCE.to_string();
        let result = engine(&broker, &store, dlq_loop)
            .spawn(CancellationToken::new())
            .await;
        assert!(matches!(result, Err(IngestError::InvalidConfig { .. })));
    }
}
