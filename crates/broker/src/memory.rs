//! In-memory broker
//!
//! 进程内 broker：分区日志 + 订阅游标，支持注入失败场景。

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use contracts::{
    BrokerClient, BrokerConfig, ContractError, MessageId, ProducerKey, SubscriptionConfig,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, instrument};

use crate::consumer::MemoryConsumer;
use crate::producer::MemoryProducer;
use crate::topic::{Entry, SubscriptionState, TopicState};

/// In-memory broker configuration
#[derive(Debug, Clone)]
pub struct MemoryBrokerConfig {
    /// Partitions of topics created on first use
    pub default_partitions: u32,
    /// Redeliver messages left unacknowledged this long
    pub ack_timeout: Option<Duration>,
    /// Simulated producer creation latency
    pub producer_create_delay: Duration,
}

impl Default for MemoryBrokerConfig {
    fn default() -> Self {
        Self {
            default_partitions: 1,
            ack_timeout: None,
            producer_create_delay: Duration::ZERO,
        }
    }
}

impl From<&BrokerConfig> for MemoryBrokerConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            default_partitions: config.default_partitions,
            ack_timeout: config.ack_timeout(),
            producer_create_delay: Duration::ZERO,
        }
    }
}

/// Broker-wide counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub producers_created: u64,
    pub producers_closed: u64,
    pub consumers_created: u64,
    pub published: u64,
    pub acknowledged: u64,
    pub redelivered: u64,
}

#[derive(Debug, Default)]
struct Faults {
    producer_creation: HashSet<String>,
    publish: HashSet<String>,
}

#[derive(Debug, Default)]
struct Counters {
    producers_created: AtomicU64,
    producers_closed: AtomicU64,
    consumers_created: AtomicU64,
    published: AtomicU64,
    acknowledged: AtomicU64,
    redelivered: AtomicU64,
    creations_by_topic: Mutex<HashMap<String, u64>>,
    closes_by_topic: Mutex<HashMap<String, u64>>,
}

/// State shared by the broker and every handle it created
#[derive(Debug)]
pub(crate) struct Shared {
    pub config: MemoryBrokerConfig,
    pub topics: Mutex<HashMap<String, TopicState>>,
    /// Woken on publish, nack, detach and seek
    pub notify: Notify,
    faults: Mutex<Faults>,
    counters: Counters,
    next_consumer_id: AtomicU64,
}

impl Shared {
    fn topic_mut<'a>(
        &self,
        topics: &'a mut HashMap<String, TopicState>,
        topic: &str,
    ) -> &'a mut TopicState {
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(self.config.default_partitions))
    }

    /// Append a message and wake waiting consumers
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        content: Bytes,
        round_robin: u32,
    ) -> Result<MessageId, ContractError> {
        if self.faults.lock().publish.contains(topic) {
            return Err(ContractError::publish(topic, "injected publish failure"));
        }

        let id = {
            let mut topics = self.topics.lock();
            let state = self.topic_mut(&mut topics, topic);
            let partitions = state.partition_count();
            let partition = match key {
                Some(key) => {
                    let mut hasher = DefaultHasher::new();
                    key.hash(&mut hasher);
                    (hasher.finish() % partitions as u64) as u32
                }
                None => round_robin % partitions,
            };
            let entry = state.append(
                partition,
                Entry {
                    key: key.map(str::to_string),
                    content,
                    publish_time: Utc::now(),
                },
            );
            MessageId::new(topic, partition, entry)
        };

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_waiters();
        Ok(id)
    }

    pub fn record_producer_closed(&self, topic: &str) {
        self.counters.producers_closed.fetch_add(1, Ordering::Relaxed);
        *self
            .counters
            .closes_by_topic
            .lock()
            .entry(topic.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_acknowledged(&self, count: u64) {
        self.counters.acknowledged.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self, count: u64) {
        if count > 0 {
            self.counters.redelivered.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Remove a consumer from all of its subscriptions
    pub fn detach(&self, consumer: u64, config: &SubscriptionConfig) {
        let requeued = {
            let mut topics = self.topics.lock();
            let mut requeued = 0;
            for topic in &config.topics {
                if let Some(sub) = topics
                    .get_mut(topic)
                    .and_then(|t| t.subscriptions.get_mut(&config.subscription_name))
                {
                    requeued += sub.detach(consumer);
                }
            }
            requeued
        };
        self.record_redelivered(requeued as u64);
        self.notify.notify_waiters();
    }
}

/// In-memory broker (cheaply cloneable, clones share state)
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Broker with default configuration (single-partition topics)
    pub fn new() -> Self {
        Self::with_config(MemoryBrokerConfig::default())
    }

    pub fn with_config(config: MemoryBrokerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                topics: Mutex::new(HashMap::new()),
                notify: Notify::new(),
                faults: Mutex::new(Faults::default()),
                counters: Counters::default(),
                next_consumer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create a topic with an explicit partition count (no-op if it exists)
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        self.shared
            .topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partitions));
    }

    /// Make producer creation for `topic` fail until reset
    pub fn fail_producer_creation(&self, topic: &str, fail: bool) {
        let mut faults = self.shared.faults.lock();
        if fail {
            faults.producer_creation.insert(topic.to_string());
        } else {
            faults.producer_creation.remove(topic);
        }
    }

    /// Make publishes to `topic` fail until reset
    pub fn fail_publish(&self, topic: &str, fail: bool) {
        let mut faults = self.shared.faults.lock();
        if fail {
            faults.publish.insert(topic.to_string());
        } else {
            faults.publish.remove(topic);
        }
    }

    /// Publish without a producer handle (test seeding)
    pub fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        content: Bytes,
    ) -> Result<MessageId, ContractError> {
        self.shared.publish(topic, key, content, 0)
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.shared.counters;
        BrokerStats {
            producers_created: c.producers_created.load(Ordering::Relaxed),
            producers_closed: c.producers_closed.load(Ordering::Relaxed),
            consumers_created: c.consumers_created.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
        }
    }

    /// Producers ever created for `topic`
    pub fn producer_creations(&self, topic: &str) -> u64 {
        self.shared
            .counters
            .creations_by_topic
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Producers closed for `topic`
    pub fn producer_closes(&self, topic: &str) -> u64 {
        self.shared
            .counters
            .closes_by_topic
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// All payloads published to `topic`, partition by partition
    pub fn messages(&self, topic: &str) -> Vec<Bytes> {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map(TopicState::contents)
            .unwrap_or_default()
    }

    pub fn message_count(&self, topic: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .map(TopicState::len)
            .unwrap_or(0)
    }

    /// Messages of `topic` not yet acknowledged on `subscription`
    pub fn backlog(&self, topic: &str, subscription: &str) -> u64 {
        let topics = self.shared.topics.lock();
        let Some(state) = topics.get(topic) else {
            return 0;
        };
        let ends = state.end_positions();
        state
            .subscriptions
            .get(subscription)
            .map(|sub| sub.backlog(&ends))
            .unwrap_or(0)
    }

    /// Consumers currently receiving on `subscription`
    pub fn active_consumers(&self, topic: &str, subscription: &str) -> usize {
        self.shared
            .topics
            .lock()
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map(SubscriptionState::active_consumers)
            .unwrap_or(0)
    }

    fn attach(&self, id: u64, config: &SubscriptionConfig) -> Result<(), ContractError> {
        let mut topics = self.shared.topics.lock();

        // 先整体校验，避免部分 attach
        for topic in &config.topics {
            let state = self.shared.topic_mut(&mut topics, topic);
            if let Some(sub) = state.subscriptions.get(&config.subscription_name) {
                if sub.kind != config.kind {
                    return Err(ContractError::subscribe(
                        &config.subscription_name,
                        format!("subscription exists with kind {:?}", sub.kind),
                    ));
                }
            }
        }

        let mut attached: Vec<&String> = Vec::new();
        for topic in &config.topics {
            let state = self.shared.topic_mut(&mut topics, topic);
            let ends = state.end_positions();
            let sub = state
                .subscriptions
                .entry(config.subscription_name.clone())
                .or_insert_with(|| {
                    SubscriptionState::new(config.kind, config.initial_position, &ends)
                });
            if let Err(message) = sub.attach(id) {
                for done in attached {
                    if let Some(sub) = topics
                        .get_mut(done.as_str())
                        .and_then(|t| t.subscriptions.get_mut(&config.subscription_name))
                    {
                        sub.detach(id);
                    }
                }
                return Err(ContractError::subscribe(&config.subscription_name, message));
            }
            attached.push(topic);
        }
        Ok(())
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for InMemoryBroker {
    type Producer = MemoryProducer;
    type Consumer = MemoryConsumer;

    #[instrument(
        name = "memory_broker_create_producer",
        skip(self, key),
        fields(topic = %key.topic)
    )]
    async fn create_producer(&self, key: &ProducerKey) -> Result<MemoryProducer, ContractError> {
        if !self.shared.config.producer_create_delay.is_zero() {
            tokio::time::sleep(self.shared.config.producer_create_delay).await;
        }

        if self
            .shared
            .faults
            .lock()
            .producer_creation
            .contains(&key.topic)
        {
            return Err(ContractError::producer_creation(
                &key.topic,
                "injected creation failure",
            ));
        }

        self.shared
            .counters
            .producers_created
            .fetch_add(1, Ordering::Relaxed);
        *self
            .shared
            .counters
            .creations_by_topic
            .lock()
            .entry(key.topic.clone())
            .or_insert(0) += 1;

        debug!(topic = %key.topic, "producer created");
        Ok(MemoryProducer::new(Arc::clone(&self.shared), key.clone()))
    }

    #[instrument(
        name = "memory_broker_create_consumer",
        skip(self, config),
        fields(subscription = %config.subscription_name, kind = ?config.kind)
    )]
    async fn create_consumer(
        &self,
        config: SubscriptionConfig,
    ) -> Result<MemoryConsumer, ContractError> {
        if config.topics.is_empty() {
            return Err(ContractError::subscribe(
                &config.subscription_name,
                "no topics given",
            ));
        }

        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.attach(id, &config)?;

        self.shared
            .counters
            .consumers_created
            .fetch_add(1, Ordering::Relaxed);
        self.shared.notify.notify_waiters();

        debug!(consumer_id = id, consumer = %config.consumer_name, "consumer attached");
        Ok(MemoryConsumer::new(Arc::clone(&self.shared), id, config))
    }
}
