//! Broker client abstraction
//!
//! Narrow publish/subscribe interface the data-plane is written against.
//! The broker itself is an already-durable external service; implementations
//! live outside this crate (see the `broker` crate for the in-memory one).

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{ContractError, Message, MessageId};

/// Payload schema announced by a producer/consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// JSON-encoded `TelemetryEvent`
    #[default]
    Json,
    /// Opaque bytes
    Binary,
}

/// Producer batching profile
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThroughputMode {
    /// Send immediately, one message per request
    #[default]
    LowLatency,
    /// Allow the client to batch sends
    HighThroughput,
}

/// Cache key of a pooled producer
///
/// Two requests with an identical key resolve to the same live producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProducerKey {
    pub topic: String,
    pub content_type: ContentType,
    pub sender_name: Option<String>,
    pub throughput_mode: ThroughputMode,
}

impl ProducerKey {
    /// Key with default content type and throughput mode
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            content_type: ContentType::default(),
            sender_name: None,
            throughput_mode: ThroughputMode::default(),
        }
    }

    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_sender_name(mut self, sender_name: impl Into<String>) -> Self {
        self.sender_name = Some(sender_name.into());
        self
    }

    pub fn with_throughput_mode(mut self, mode: ThroughputMode) -> Self {
        self.throughput_mode = mode;
        self
    }
}

/// Logical delivery semantics requested by a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Every subscriber instance receives every message
    Broadcast,
    /// Exactly one subscriber in the group receives each message, no ordering
    Competing,
    /// One active subscriber per partition, order preserved, automatic failover
    Ordered,
}

/// Concrete subscription kind understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// Single consumer owns the cursor
    Exclusive,
    /// Messages spread across all consumers
    Shared,
    /// One consumer per partition, others on standby
    Failover,
}

/// Where a brand new subscription cursor starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InitialPosition {
    #[default]
    Earliest,
    Latest,
}

/// Concrete consumer parameters handed to [`BrokerClient::create_consumer`]
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Topics consumed by this consumer
    pub topics: Vec<String>,

    /// Broker-side subscription (cursor) name
    pub subscription_name: String,

    /// Consumer name, unique per process
    pub consumer_name: String,

    pub kind: SubscriptionKind,

    pub initial_position: InitialPosition,

    pub content_type: ContentType,

    /// How long acknowledgments may be coalesced before being sent
    pub ack_group_time: Duration,

    /// Delivered-but-unacknowledged bound (client delivery buffer), 0 = unbounded
    pub max_unacked_messages: usize,
}

/// Outbound publisher handle
pub trait Producer: Send + Sync + 'static {
    /// Topic this producer publishes to
    fn topic(&self) -> &str;

    /// Publish a payload, resolving once the broker assigned a position
    fn send(&self, content: Bytes) -> impl Future<Output = Result<MessageId, ContractError>> + Send;

    /// Publish with a routing key (same key, same partition)
    fn send_keyed(
        &self,
        key: &str,
        content: Bytes,
    ) -> impl Future<Output = Result<MessageId, ContractError>> + Send;

    /// Close the producer. Sends after close fail.
    fn close(&self) -> impl Future<Output = Result<(), ContractError>> + Send;
}

/// Inbound subscriber handle
///
/// All operations take `&self` so one consumer can be shared between a
/// receive loop and acknowledgment tasks.
pub trait Consumer: Send + Sync + 'static {
    /// Subscription name this consumer is attached to
    fn subscription(&self) -> &str;

    /// Wait for the next message
    fn receive(&self) -> impl Future<Output = Result<Message, ContractError>> + Send;

    fn acknowledge(&self, id: &MessageId)
        -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Acknowledge a group of messages in one call
    fn acknowledge_many(
        &self,
        ids: &[MessageId],
    ) -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Acknowledge every message of the partition up to and including `id`
    ///
    /// Not allowed on shared subscriptions.
    fn acknowledge_cumulative(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Ask the broker to redeliver the message
    fn negative_acknowledge(
        &self,
        id: &MessageId,
    ) -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Reset the cursor of `id`'s partition so `id` is delivered next
    fn seek(&self, id: &MessageId) -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Skip everything published so far
    fn seek_to_latest(&self) -> impl Future<Output = Result<(), ContractError>> + Send;

    /// Detach from the subscription, flushing pending acknowledgments
    fn close(&self) -> impl Future<Output = Result<(), ContractError>> + Send;
}

/// Broker client trait
///
/// Supports a unified interface for the real broker client and the in-memory broker.
pub trait BrokerClient: Send + Sync + 'static {
    type Producer: Producer;
    type Consumer: Consumer;

    /// Open a new (unpooled) producer
    fn create_producer(
        &self,
        key: &ProducerKey,
    ) -> impl Future<Output = Result<Self::Producer, ContractError>> + Send;

    /// Attach a consumer to a subscription
    fn create_consumer(
        &self,
        config: SubscriptionConfig,
    ) -> impl Future<Output = Result<Self::Consumer, ContractError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_producer_key_identity() {
        let a = ProducerKey::new("dataset-weather");
        let b = ProducerKey::new("dataset-weather");
        let c = ProducerKey::new("dataset-weather").with_throughput_mode(ThroughputMode::HighThroughput);

        let keys: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_mode_serde_names() {
        let mode: SubscriptionMode = serde_json::from_str("\"ordered\"").unwrap();
        assert_eq!(mode, SubscriptionMode::Ordered);
    }
}
