//! Message and TelemetryEvent - the units moved by the data-plane

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ContractError;

/// Broker-assigned message position
///
/// Totally ordered within a partition. Ids from different topics compare by
/// topic name first, which is only useful for grouping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId {
    topic: Arc<str>,
    partition: u32,
    entry: u64,
}

impl MessageId {
    pub fn new(topic: impl Into<Arc<str>>, partition: u32, entry: u64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            entry,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn entry(&self) -> u64 {
        self.entry
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.topic, self.partition, self.entry)
    }
}

/// Immutable message as delivered to a consumer
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker position
    pub id: MessageId,

    /// Routing key used at publish time (if any)
    pub key: Option<String>,

    /// Raw payload (zero-copy)
    pub content: Bytes,

    /// Broker publish time
    pub publish_time: DateTime<Utc>,

    /// Number of times this message was handed out before
    pub redelivery_count: u32,
}

impl Message {
    pub fn topic(&self) -> &str {
        self.id.topic()
    }
}

/// Timestamped sensor/metric event carried as a JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Producer-assigned unique id (idempotency key in storage)
    pub event_id: String,

    /// Dataset the event belongs to (drives per-dataset fan-out)
    pub dataset_id: String,

    /// Emitting device or service
    pub source: String,

    /// Metric name
    pub metric: String,

    /// Sampled value
    pub value: f64,

    /// Event time
    pub timestamp: DateTime<Utc>,

    /// Free-form dimensions
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl TelemetryEvent {
    /// Decode from a JSON payload
    pub fn decode(content: &[u8]) -> Result<Self, ContractError> {
        serde_json::from_slice(content).map_err(|e| ContractError::payload_decode(e.to_string()))
    }

    /// Encode to a JSON payload
    pub fn encode(&self) -> Result<Bytes, ContractError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ContractError::PayloadEncode {
                message: e.to_string(),
            })
    }

    /// Record-level checks a decodable event can still fail
    pub fn validate(&self) -> Result<(), String> {
        if self.event_id.is_empty() {
            return Err("event_id is empty".to_string());
        }
        if self.dataset_id.is_empty() {
            return Err("dataset_id is empty".to_string());
        }
        if !self.value.is_finite() {
            return Err(format!("value {} is not finite", self.value));
        }
        Ok(())
    }
}
