//! In-memory consumer handle

use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use contracts::{ContractError, Consumer, Message, MessageId, SubscriptionConfig};
use parking_lot::Mutex;
use tracing::{debug, instrument, trace};

use crate::memory::Shared;

/// Wake-up interval while idle (covers ack-group and ack-timeout deadlines)
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Default)]
struct AckBuffer {
    ids: Vec<MessageId>,
    since: Option<Instant>,
}

/// Consumer attached to one subscription across one or more topics
#[derive(Debug)]
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    id: u64,
    config: SubscriptionConfig,
    closed: AtomicBool,
    acks: Mutex<AckBuffer>,
    /// Partition scan start, rotated for fairness
    rotation: AtomicUsize,
}

impl MemoryConsumer {
    pub(crate) fn new(shared: Arc<Shared>, id: u64, config: SubscriptionConfig) -> Self {
        Self {
            shared,
            id,
            config,
            closed: AtomicBool::new(false),
            acks: Mutex::new(AckBuffer::default()),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn consumer_name(&self) -> &str {
        &self.config.consumer_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ContractError> {
        if self.is_closed() {
            Err(ContractError::closed(format!(
                "consumer '{}'",
                self.config.consumer_name
            )))
        } else {
            Ok(())
        }
    }

    fn ack_error(&self, message: impl Into<String>) -> ContractError {
        ContractError::acknowledge(&self.config.subscription_name, message)
    }

    /// Hand out the next available message, if any
    fn try_next(&self) -> Option<Message> {
        let rotation = self.rotation.fetch_add(1, Ordering::Relaxed);
        let topic_count = self.config.topics.len();
        let mut topics = self.shared.topics.lock();

        for offset in 0..topic_count {
            let topic = &self.config.topics[(rotation + offset) % topic_count];
            let Some(state) = topics.get_mut(topic) else {
                continue;
            };
            let ends = state.end_positions();
            let Some(sub) = state.subscriptions.get_mut(&self.config.subscription_name) else {
                continue;
            };

            if let Some(timeout) = self.shared.config.ack_timeout {
                let expired = sub.requeue_expired(timeout);
                self.shared.record_redelivered(expired as u64);
            }

            let Some(delivery) =
                sub.next_for(self.id, &ends, self.config.max_unacked_messages, rotation)
            else {
                continue;
            };
            let entry = state.entry(delivery.partition, delivery.entry)?;
            return Some(Message {
                id: MessageId::new(topic.as_str(), delivery.partition, delivery.entry),
                key: entry.key.clone(),
                content: entry.content.clone(),
                publish_time: entry.publish_time,
                redelivery_count: delivery.redelivery_count,
            });
        }
        None
    }

    /// Apply acknowledgments to the subscription cursors
    fn apply_acks(&self, ids: &[MessageId]) -> Result<(), ContractError> {
        let mut applied = 0;
        {
            let mut topics = self.shared.topics.lock();
            for id in ids {
                let state = topics
                    .get_mut(id.topic())
                    .ok_or_else(|| self.ack_error(format!("unknown topic '{}'", id.topic())))?;
                let end = state
                    .end_positions()
                    .get(id.partition() as usize)
                    .copied()
                    .unwrap_or(0);
                let sub = state
                    .subscriptions
                    .get_mut(&self.config.subscription_name)
                    .ok_or_else(|| self.ack_error("subscription not found"))?;
                if sub.acknowledge(id.partition(), id.entry(), end) {
                    applied += 1;
                }
            }
        }
        self.shared.record_acknowledged(applied);
        Ok(())
    }

    fn take_acks(&self, force: bool) -> Vec<MessageId> {
        let mut buffer = self.acks.lock();
        let due = buffer
            .since
            .is_some_and(|since| since.elapsed() >= self.config.ack_group_time);
        if force || due {
            buffer.since = None;
            std::mem::take(&mut buffer.ids)
        } else {
            Vec::new()
        }
    }

    fn flush_acks(&self, force: bool) -> Result<(), ContractError> {
        let ids = self.take_acks(force);
        if ids.is_empty() {
            return Ok(());
        }
        trace!(count = ids.len(), "flushing grouped acknowledgments");
        self.apply_acks(&ids)
    }

    fn queue_acks(&self, ids: &[MessageId]) -> Result<(), ContractError> {
        if self.config.ack_group_time.is_zero() {
            return self.apply_acks(ids);
        }
        {
            let mut buffer = self.acks.lock();
            buffer.ids.extend_from_slice(ids);
            buffer.since.get_or_insert_with(Instant::now);
        }
        self.flush_acks(false)
    }

    fn with_subscription<T>(
        &self,
        id: &MessageId,
        f: impl FnOnce(&mut crate::topic::SubscriptionState, u64) -> Result<T, String>,
    ) -> Result<T, ContractError> {
        let mut topics = self.shared.topics.lock();
        let state = topics
            .get_mut(id.topic())
            .ok_or_else(|| self.ack_error(format!("unknown topic '{}'", id.topic())))?;
        let end = state
            .end_positions()
            .get(id.partition() as usize)
            .copied()
            .unwrap_or(0);
        let sub = state
            .subscriptions
            .get_mut(&self.config.subscription_name)
            .ok_or_else(|| self.ack_error("subscription not found"))?;
        f(sub, end).map_err(|message| self.ack_error(message))
    }

    fn detach(&self) {
        if let Err(e) = self.flush_acks(true) {
            debug!(error = %e, "dropping grouped acknowledgments on detach");
        }
        self.shared.detach(self.id, &self.config);
    }
}

impl Consumer for MemoryConsumer {
    fn subscription(&self) -> &str {
        &self.config.subscription_name
    }

    async fn receive(&self) -> Result<Message, ContractError> {
        loop {
            self.ensure_open()?;

            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();

            self.flush_acks(false)?;
            if let Some(message) = self.try_next() {
                return Ok(message);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
            }
        }
    }

    async fn acknowledge(&self, id: &MessageId) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.queue_acks(std::slice::from_ref(id))
    }

    async fn acknowledge_many(&self, ids: &[MessageId]) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.queue_acks(ids)
    }

    #[instrument(name = "memory_consumer_ack_cumulative", skip(self, id), fields(id = %id))]
    async fn acknowledge_cumulative(&self, id: &MessageId) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.flush_acks(true)?;
        let newly = self.with_subscription(id, |sub, end| {
            sub.acknowledge_cumulative(id.partition(), id.entry(), end)
        })?;
        self.shared.record_acknowledged(newly);
        Ok(())
    }

    async fn negative_acknowledge(&self, id: &MessageId) -> Result<(), ContractError> {
        self.ensure_open()?;
        let requeued = self.with_subscription(id, |sub, _| {
            Ok(sub.negative_acknowledge(id.partition(), id.entry()))
        })?;
        if requeued {
            self.shared.record_redelivered(1);
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    #[instrument(name = "memory_consumer_seek", skip(self, id), fields(id = %id))]
    async fn seek(&self, id: &MessageId) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.flush_acks(true)?;
        self.with_subscription(id, |sub, end| {
            if sub.seek(id.partition(), id.entry(), end) {
                Ok(())
            } else {
                Err(format!("unknown partition {}", id.partition()))
            }
        })?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn seek_to_latest(&self) -> Result<(), ContractError> {
        self.ensure_open()?;
        self.flush_acks(true)?;
        {
            let mut topics = self.shared.topics.lock();
            for topic in &self.config.topics {
                if let Some(state) = topics.get_mut(topic) {
                    let ends = state.end_positions();
                    if let Some(sub) = state.subscriptions.get_mut(&self.config.subscription_name)
                    {
                        sub.seek_to_latest(&ends);
                    }
                }
            }
        }
        Ok(())
    }

    #[instrument(name = "memory_consumer_close", skip(self), fields(consumer = %self.config.consumer_name))]
    async fn close(&self) -> Result<(), ContractError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.detach();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use contracts::{
        BrokerClient, ContentType, Consumer, ContractError, InitialPosition, SubscriptionConfig,
        SubscriptionKind,
    };

    use crate::{InMemoryBroker, MemoryBrokerConfig};

    fn config(name: &str, consumer: &str, kind: SubscriptionKind) -> SubscriptionConfig {
        SubscriptionConfig {
            topics: vec!["events".to_string()],
            subscription_name: name.to_string(),
            consumer_name: consumer.to_string(),
            kind,
            initial_position: InitialPosition::Earliest,
            content_type: ContentType::Json,
            ack_group_time: Duration::ZERO,
            max_unacked_messages: 0,
        }
    }

    async fn recv(consumer: &impl Consumer) -> contracts::Message {
        tokio::time::timeout(Duration::from_secs(2), consumer.receive())
            .await
            .expect("receive timed out")
            .unwrap()
    }

    #[tokio::test]
    async fn test_receive_waits_for_publish() {
        let broker = InMemoryBroker::new();
        let consumer = Arc::new(
            broker
                .create_consumer(config("s", "c1", SubscriptionKind::Exclusive))
                .await
                .unwrap(),
        );

        let waiter = {
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { recv(consumer.as_ref()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("events", None, Bytes::from_static(b"hello")).unwrap();

        let msg = waiter.await.unwrap();
        assert_eq!(msg.content, Bytes::from_static(b"hello"));
        assert_eq!(msg.redelivery_count, 0);
    }

    #[tokio::test]
    async fn test_shared_consumers_split_messages() {
        let broker = InMemoryBroker::new();
        let a = broker
            .create_consumer(config("group", "a", SubscriptionKind::Shared))
            .await
            .unwrap();
        let b = broker
            .create_consumer(config("group", "b", SubscriptionKind::Shared))
            .await
            .unwrap();
        for i in 0..10u8 {
            broker.publish("events", None, Bytes::from(vec![i])).unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..5 {
            seen.insert(recv(&a).await.id);
            seen.insert(recv(&b).await.id);
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_closed_consumer_messages_are_redelivered() {
        let broker = InMemoryBroker::new();
        let a = broker
            .create_consumer(config("group", "a", SubscriptionKind::Shared))
            .await
            .unwrap();
        let b = broker
            .create_consumer(config("group", "b", SubscriptionKind::Shared))
            .await
            .unwrap();
        broker.publish("events", None, Bytes::from_static(b"x")).unwrap();

        let first = recv(&a).await;
        a.close().await.unwrap();
        assert!(matches!(a.receive().await, Err(ContractError::Closed { .. })));

        let again = recv(&b).await;
        assert_eq!(again.id, first.id);
        assert_eq!(again.redelivery_count, 1);
    }

    #[tokio::test]
    async fn test_grouped_acks_flush_on_close() {
        let broker = InMemoryBroker::new();
        let mut cfg = config("group", "a", SubscriptionKind::Shared);
        cfg.ack_group_time = Duration::from_secs(60);
        let consumer = broker.create_consumer(cfg).await.unwrap();
        broker.publish("events", None, Bytes::from_static(b"x")).unwrap();

        let msg = recv(&consumer).await;
        consumer.acknowledge(&msg.id).await.unwrap();
        assert_eq!(broker.backlog("events", "group"), 1);

        consumer.close().await.unwrap();
        assert_eq!(broker.backlog("events", "group"), 0);
    }

    #[tokio::test]
    async fn test_ack_timeout_redelivers() {
        let broker = InMemoryBroker::with_config(MemoryBrokerConfig {
            ack_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let consumer = broker
            .create_consumer(config("s", "c", SubscriptionKind::Exclusive))
            .await
            .unwrap();
        broker.publish("events", None, Bytes::from_static(b"x")).unwrap();

        let first = recv(&consumer).await;
        let again = recv(&consumer).await;
        assert_eq!(first.id, again.id);
        assert_eq!(again.redelivery_count, 1);
    }

    #[tokio::test]
    async fn test_latest_position_skips_history() {
        let broker = InMemoryBroker::new();
        broker.publish("events", None, Bytes::from_static(b"old")).unwrap();
        let mut cfg = config("fresh", "c", SubscriptionKind::Exclusive);
        cfg.initial_position = InitialPosition::Latest;
        let consumer = broker.create_consumer(cfg).await.unwrap();
        broker.publish("events", None, Bytes::from_static(b"new")).unwrap();

        assert_eq!(recv(&consumer).await.content, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_failover_standby_takes_over() {
        let broker = InMemoryBroker::new();
        let active = broker
            .create_consumer(config("ordered", "a", SubscriptionKind::Failover))
            .await
            .unwrap();
        let standby = broker
            .create_consumer(config("ordered", "b", SubscriptionKind::Failover))
            .await
            .unwrap();
        assert_eq!(broker.active_consumers("events", "ordered"), 1);

        for i in 0..3u8 {
            broker.publish("events", None, Bytes::from(vec![i])).unwrap();
        }
        let m0 = recv(&active).await;
        active.acknowledge(&m0.id).await.unwrap();
        let _m1 = recv(&active).await;
        drop(active);

        let order: Vec<u8> = vec![recv(&standby).await.content[0], recv(&standby).await.content[0]];
        assert_eq!(order, vec![1, 2]);
    }
}
