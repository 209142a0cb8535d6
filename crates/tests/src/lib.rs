//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 配置 → 组件装配测试
//! - 内存 broker 上的 e2e 场景 (ingest / DLQ / router / producer pool)
//! - 守恒与幂等性检查

#[cfg(test)]
mod support {
    use std::sync::Arc;
    use std::time::Duration;

    use broker::InMemoryBroker;
    use bytes::Bytes;
    use chrono::{TimeDelta, Utc};
    use contracts::{IngestConfig, RouterConfig, TelemetryEvent};
    use ingestion::IngestionEngine;
    use producer_pool::ProducerPool;
    use router::DatasetRouter;
    use storage::MemoryStore;
    use subscription::{SubscriptionManager, SubscriptionSettings};

    pub const SOURCE: &str = "telemetry-ingest";
    pub const SINK_SUBSCRIPTION: &str = "telemetry-sink";
    pub const DLQ: &str = "telemetry-dlq";
    pub const GLOBAL: &str = "telemetry-global";
    pub const ROUTER_SUBSCRIPTION: &str = "telemetry-router";

    pub fn event(id: &str, dataset: &str, age: TimeDelta) -> TelemetryEvent {
        TelemetryEvent {
            event_id: id.to_string(),
            dataset_id: dataset.to_string(),
            source: "sensor-1".to_string(),
            metric: "temperature".to_string(),
            value: 21.5,
            timestamp: Utc::now() - age,
            tags: Default::default(),
        }
    }

    pub fn payload(id: &str, dataset: &str) -> Bytes {
        event(id, dataset, TimeDelta::zero()).encode().unwrap()
    }

    pub fn ingest_config(max_window_size: usize, flush_interval_ms: u64) -> IngestConfig {
        IngestConfig {
            source_topics: vec![SOURCE.to_string()],
            subscription_name: SINK_SUBSCRIPTION.to_string(),
            dlq_topic: DLQ.to_string(),
            max_window_size,
            flush_interval_ms,
            overflow_backoff_ms: 5,
            ..IngestConfig::default()
        }
    }

    pub fn router_config() -> RouterConfig {
        RouterConfig {
            global_topic: GLOBAL.to_string(),
            subscription_name: ROUTER_SUBSCRIPTION.to_string(),
            ..RouterConfig::default()
        }
    }

    /// Shared wiring of one data-plane process
    pub struct Plane {
        pub store: MemoryStore,
        pub subscriptions: Arc<SubscriptionManager<InMemoryBroker>>,
        pub pool: Arc<ProducerPool<InMemoryBroker>>,
    }

    impl Plane {
        pub fn new(broker: &InMemoryBroker) -> Self {
            Self {
                store: MemoryStore::new("memory"),
                subscriptions: Arc::new(SubscriptionManager::new(
                    broker.clone(),
                    SubscriptionSettings::new("node-1"),
                )),
                pool: Arc::new(ProducerPool::with_limits(
                    broker.clone(),
                    100,
                    Duration::from_secs(600),
                )),
            }
        }

        pub fn ingestion(&self, config: IngestConfig) -> IngestionEngine<InMemoryBroker, MemoryStore> {
            IngestionEngine::new(
                config,
                Arc::clone(&self.subscriptions),
                Arc::clone(&self.pool),
                Arc::new(self.store.clone()),
            )
        }

        pub fn router(&self, config: RouterConfig) -> DatasetRouter<InMemoryBroker> {
            DatasetRouter::new(config, Arc::clone(&self.subscriptions), Arc::clone(&self.pool))
        }
    }

    pub async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }
}

#[cfg(test)]
mod config_tests {
    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::AckPolicy;

    #[test]
    fn test_config_file_drives_component_settings() {
        let config = ConfigLoader::load_from_str(
            r#"
instance_id = "node-7"

[producer_pool]
max_size = 2

[ingest]
source_topics = ["a", "b"]
max_window_size = 500

[router]
ack_policy = "always"
"#,
            ConfigFormat::Toml,
        )
        .unwrap();

        assert_eq!(config.instance_id, "node-7");
        assert_eq!(config.producer_pool.max_size, 2);
        assert_eq!(config.ingest.ingress_capacity(), 500 * config.ingest.overflow_buffer_multiplier);
        assert_eq!(config.router.ack_policy, AckPolicy::Always);
        assert_eq!(config.router.dataset_topic("weather"), "dataset-weather");
    }
}

#[cfg(test)]
mod ingest_e2e_tests {
    use bytes::Bytes;
    use chrono::TimeDelta;
    use contracts::TelemetryEvent;
    use tokio_util::sync::CancellationToken;

    use super::support::*;
    use broker::InMemoryBroker;
    use observability::MetricsSummary;

    /// 10,000 valid events: every one stored, every one acked, nothing in the DLQ
    #[tokio::test]
    async fn test_steady_stream_is_fully_persisted() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..10_000 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let handle = plane
            .ingestion(ingest_config(1000, 2000))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 10_000).await;

        let stats = handle.stats();
        assert_eq!(stats.persisted, 10_000);
        assert_eq!(stats.dlq_attempted, 0);
        assert_eq!(plane.store.count(), 10_000);
        assert_eq!(broker.message_count(DLQ), 0);
        assert_eq!(broker.backlog(SOURCE, SINK_SUBSCRIPTION), 0);

        let summary = handle.window_summary();
        assert_eq!(summary.total_persisted, 10_000);
        assert!(summary.window_size.max <= 1000.0);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// 1% corrupt payloads: 99% stored, 1% in the DLQ, 100% acked
    #[tokio::test]
    async fn test_corrupt_payloads_route_to_dlq() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..1000 {
            let content = if i % 100 == 99 {
                Bytes::from(format!("{{\"event_id\": \"e{i}\""))
            } else {
                payload(&format!("e{i}"), "traffic")
            };
            broker.publish(SOURCE, None, content).unwrap();
        }

        let handle = plane
            .ingestion(ingest_config(100, 50))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 1000).await;

        assert_eq!(plane.store.count(), 990);
        assert_eq!(broker.message_count(DLQ), 10);
        assert_eq!(handle.stats().decode_failures, 10);
        assert_eq!(broker.backlog(SOURCE, SINK_SUBSCRIPTION), 0);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// persisted + DLQ == acked, with store-rejected and undecodable records mixed in
    #[tokio::test]
    async fn test_every_message_accounted_for() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..300 {
            let content = match i % 30 {
                // 存储拒绝 (dataset_id 为空)
                7 => payload(&format!("e{i}"), ""),
                13 => Bytes::from_static(b"not json"),
                _ => payload(&format!("e{i}"), "energy"),
            };
            broker.publish(SOURCE, None, content).unwrap();
        }

        let handle = plane
            .ingestion(ingest_config(64, 30))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 300).await;

        let stats = handle.stats();
        assert_eq!(stats.persisted, 280);
        assert_eq!(stats.dlq_attempted, 20);
        assert_eq!(stats.processed(), stats.acked);

        // DLQ 条目保留原始 payload
        let dlq = broker.messages(DLQ);
        assert_eq!(dlq.len(), 20);
        assert!(dlq.iter().any(|m| m.as_ref() == b"not json"));

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// Redelivered duplicates do not produce duplicate records
    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        let content = TelemetryEvent::encode(&event("dup-1", "weather", TimeDelta::zero())).unwrap();
        broker.publish(SOURCE, None, content.clone()).unwrap();
        broker.publish(SOURCE, None, content).unwrap();
        broker.publish(SOURCE, None, payload("other", "weather")).unwrap();

        let handle = plane
            .ingestion(ingest_config(10, 20))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 3).await;

        assert_eq!(plane.store.count(), 2);
        assert_eq!(plane.store.duplicates(), 1);
        assert_eq!(plane.store.events_for("weather").len(), 2);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// Exactly max_window_size messages close one count-triggered window
    #[tokio::test]
    async fn test_window_boundary_is_count_triggered() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..10 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let handle = plane
            .ingestion(ingest_config(10, 60_000))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 10).await;

        let summary = handle.window_summary();
        assert_eq!(summary.total_windows, 1);
        assert_eq!(summary.count_triggered, 1);
        assert_eq!(summary.time_triggered, 0);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// A partial window is flushed by the timer, not held for max_window_size
    #[tokio::test]
    async fn test_partial_window_is_time_triggered() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..7 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        let handle = plane
            .ingestion(ingest_config(100, 50))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 7).await;

        assert_eq!(plane.store.count(), 7);
        assert_eq!(handle.stats().persisted, 7);

        let summary: MetricsSummary = handle.window_summary();
        assert!(summary.time_triggered >= 1);
        assert_eq!(summary.count_triggered, 0);
        assert!(summary.window_size.max < 100.0);
        assert!(summary.to_string().contains("count-triggered 0"));

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// Decodable events failing record checks go to the DLQ and are acked
    #[tokio::test]
    async fn test_decodable_invalid_events_route_to_dlq() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        broker.publish(SOURCE, None, payload("ok-1", "weather")).unwrap();
        broker.publish(SOURCE, None, payload("no-dataset", "")).unwrap();
        broker.publish(SOURCE, None, payload("", "weather")).unwrap();
        broker.publish(SOURCE, None, payload("ok-2", "weather")).unwrap();

        let handle = plane
            .ingestion(ingest_config(10, 20))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.stats().acked == 4).await;

        let stats = handle.stats();
        assert_eq!(stats.persisted, 2);
        assert_eq!(stats.dlq_attempted, 2);
        assert_eq!(stats.decode_failures, 0);
        assert_eq!(plane.store.events_for("weather").len(), 2);
        assert_eq!(broker.message_count(DLQ), 2);
        assert_eq!(broker.backlog(SOURCE, SINK_SUBSCRIPTION), 0);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// Storage outage stops the engine with nothing acked, a restart persists all
    #[tokio::test]
    async fn test_storage_outage_then_restart() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for i in 0..20 {
            broker
                .publish(SOURCE, None, payload(&format!("e{i}"), "weather"))
                .unwrap();
        }

        plane.store.set_available(false);
        let handle = plane
            .ingestion(ingest_config(10, 20))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| handle.check_health().is_err()).await;
        assert_eq!(handle.stats().acked, 0);
        assert!(handle.join().await.is_err());

        plane.store.set_available(true);
        let handle = plane
            .ingestion(ingest_config(10, 20))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| plane.store.count() == 20).await;
        eventually(|| broker.backlog(SOURCE, SINK_SUBSCRIPTION) == 0).await;

        handle.shutdown();
        handle.join().await.unwrap();
    }
}

#[cfg(test)]
mod router_e2e_tests {
    use chrono::TimeDelta;
    use tokio_util::sync::CancellationToken;

    use super::support::*;
    use broker::InMemoryBroker;

    /// A 2-hour-old event is dropped and acked, a fresh one is forwarded
    #[tokio::test]
    async fn test_stale_event_dropped_fresh_event_forwarded() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        let stale = event("old", "weather", TimeDelta::hours(2)).encode().unwrap();
        broker.publish(GLOBAL, None, stale).unwrap();
        broker.publish(GLOBAL, None, payload("new", "weather")).unwrap();

        let handle = plane
            .router(router_config())
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| broker.backlog(GLOBAL, ROUTER_SUBSCRIPTION) == 0).await;

        let stats = handle.stats();
        assert_eq!(stats.incoming, 2);
        assert_eq!(stats.stale, 1);
        assert_eq!(stats.outgoing, 1);
        assert_eq!(broker.message_count("dataset-weather"), 1);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// An event without a dataset is never published to a dataset topic
    #[tokio::test]
    async fn test_event_without_dataset_is_dropped() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        broker.publish(GLOBAL, None, payload("orphan", "")).unwrap();
        broker.publish(GLOBAL, None, payload("good", "weather")).unwrap();

        let handle = plane
            .router(router_config())
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        eventually(|| broker.backlog(GLOBAL, ROUTER_SUBSCRIPTION) == 0).await;

        let stats = handle.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.outgoing, 1);
        assert_eq!(broker.message_count("dataset-"), 0);
        assert_eq!(broker.message_count("dataset-weather"), 1);

        handle.shutdown();
        handle.join().await.unwrap();
    }

    /// Ingest and router share one process-wide producer pool
    #[tokio::test]
    async fn test_router_feeds_dataset_topics_alongside_ingest() {
        let broker = InMemoryBroker::new();
        let plane = Plane::new(&broker);
        for (i, dataset) in ["weather", "traffic", "weather", "energy"].iter().enumerate() {
            let content = payload(&format!("g{i}"), dataset);
            broker.publish(GLOBAL, None, content.clone()).unwrap();
            broker.publish(SOURCE, None, content).unwrap();
        }

        let ingest = plane
            .ingestion(ingest_config(10, 20))
            .spawn(CancellationToken::new())
            .await
            .unwrap();
        let router = plane
            .router(router_config())
            .spawn(CancellationToken::new())
            .await
            .unwrap();

        eventually(|| router.stats().outgoing == 4 && ingest.stats().acked == 4).await;
        assert_eq!(broker.message_count("dataset-weather"), 2);
        assert_eq!(broker.message_count("dataset-traffic"), 1);
        assert_eq!(broker.message_count("dataset-energy"), 1);
        assert_eq!(broker.producer_creations("dataset-weather"), 1);
        assert_eq!(plane.store.count(), 4);

        ingest.shutdown();
        router.shutdown();
        ingest.join().await.unwrap();
        router.join().await.unwrap();

        plane.pool.shutdown().await;
        let stats = plane.pool.stats();
        assert_eq!(stats.created, stats.closed);
    }
}

#[cfg(test)]
mod pool_e2e_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use contracts::{Producer, ProducerKey};
    use producer_pool::ProducerPool;

    use super::support::eventually;
    use broker::InMemoryBroker;

    /// maxSize 2, three topics: the least recent producer is closed exactly once
    #[tokio::test]
    async fn test_bounded_pool_evicts_and_closes_once() {
        let broker = InMemoryBroker::new();
        let pool = ProducerPool::with_limits(broker.clone(), 2, Duration::from_secs(600));

        for topic in ["dataset-a", "dataset-b", "dataset-c"] {
            let producer = pool.get(&ProducerKey::new(topic)).await.unwrap();
            producer.send(bytes::Bytes::from_static(b"x")).await.unwrap();
        }

        eventually(|| broker.producer_closes("dataset-a") == 1).await;
        assert_eq!(broker.producer_closes("dataset-b"), 0);
        assert_eq!(broker.producer_closes("dataset-c"), 0);

        pool.shutdown().await;
        assert_eq!(broker.producer_closes("dataset-a"), 1);
        assert_eq!(broker.stats().producers_closed, 3);
    }

    /// 50 concurrent first-time gets share a single creation
    #[tokio::test]
    async fn test_concurrent_first_gets_create_once() {
        let broker = InMemoryBroker::new();
        let pool = Arc::new(ProducerPool::with_limits(
            broker.clone(),
            10,
            Duration::from_secs(600),
        ));
        let key = ProducerKey::new("dataset-hot");

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let key = key.clone();
                tokio::spawn(async move { pool.get(&key).await })
            })
            .collect();
        for result in futures::future::join_all(tasks).await {
            assert!(result.unwrap().is_ok());
        }

        assert_eq!(broker.producer_creations("dataset-hot"), 1);
        assert_eq!(pool.stats().created, 1);
    }
}
