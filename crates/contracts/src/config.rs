//! PlatformConfig - Config Loader output
//!
//! Every field has a default so an empty file (or no file plus environment
//! overrides) is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete data-plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    /// Process identity, embedded in broadcast subscription names
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub producer_pool: ProducerPoolConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub router: RouterConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            broker: BrokerConfig::default(),
            producer_pool: ProducerPoolConfig::default(),
            ingest: IngestConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

fn default_instance_id() -> String {
    "local".to_string()
}

/// Broker client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Partitions of topics created on first use
    pub default_partitions: u32,

    /// Acknowledgment coalescing window (ms)
    pub ack_group_time_ms: u64,

    /// Delivered-but-unacknowledged bound per consumer (0 = unbounded)
    pub max_unacked_messages: usize,

    /// Redeliver messages left unacknowledged this long (ms, 0 = never)
    pub ack_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_partitions: 4,
            ack_group_time_ms: 100,
            max_unacked_messages: 50_000,
            ack_timeout_ms: 30_000,
        }
    }
}

impl BrokerConfig {
    pub fn ack_group_time(&self) -> Duration {
        Duration::from_millis(self.ack_group_time_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }
}

/// Producer cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerPoolConfig {
    /// Maximum live producers
    pub max_size: u64,

    /// Idle time after which a producer is evicted (seconds)
    pub idle_ttl_secs: u64,
}

impl Default for ProducerPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            idle_ttl_secs: 600,
        }
    }
}

impl ProducerPoolConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

/// Batch ingestion engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub enabled: bool,

    /// Topics consumed in competing mode
    pub source_topics: Vec<String>,

    /// Shared subscription name
    pub subscription_name: String,

    /// Consumer handles attached to the shared subscription
    pub consumer_count: usize,

    /// Window time bound (ms)
    pub flush_interval_ms: u64,

    /// Window count bound
    pub max_window_size: usize,

    /// Ingress buffer size relative to `max_window_size`
    pub overflow_buffer_multiplier: usize,

    /// Windows queued between windowing and persistence
    pub persist_queue_depth: usize,

    /// Pause of a receive loop after an ingress overflow (ms)
    pub overflow_backoff_ms: u64,

    /// Destination for unwritable events
    pub dlq_topic: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source_topics: vec!["telemetry-ingest".to_string()],
            subscription_name: "telemetry-sink".to_string(),
            consumer_count: 1,
            flush_interval_ms: 2000,
            max_window_size: 1000,
            overflow_buffer_multiplier: 4,
            persist_queue_depth: 2,
            overflow_backoff_ms: 50,
            dlq_topic: "telemetry-dlq".to_string(),
        }
    }
}

impl IngestConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Ingress queue capacity
    pub fn ingress_capacity(&self) -> usize {
        self.overflow_buffer_multiplier.max(1) * self.max_window_size.max(1)
    }

    pub fn overflow_backoff(&self) -> Duration {
        Duration::from_millis(self.overflow_backoff_ms)
    }
}

/// What the router does with a message whose publish failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge only confirmed publishes, negatively acknowledge failures
    #[default]
    OnSuccess,
    /// Acknowledge regardless of publish outcome (failures are counted and lost)
    Always,
}

/// Dataset router settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub enabled: bool,

    /// Global topic consumed in ordered mode
    pub global_topic: String,

    pub subscription_name: String,

    /// Destination topic = prefix + dataset id
    pub dataset_topic_prefix: String,

    /// Events older than this are dropped (minutes)
    pub staleness_threshold_minutes: u64,

    /// In-flight resolve/send/ack pipelines
    pub max_fanout_concurrency: usize,

    pub ack_policy: AckPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global_topic: "telemetry-global".to_string(),
            subscription_name: "telemetry-router".to_string(),
            dataset_topic_prefix: "dataset-".to_string(),
            staleness_threshold_minutes: 60,
            max_fanout_concurrency: 64,
            ack_policy: AckPolicy::default(),
        }
    }
}

impl RouterConfig {
    /// `None` when the threshold does not fit a `TimeDelta` (nothing is stale)
    pub fn staleness_threshold(&self) -> Option<chrono::TimeDelta> {
        i64::try_from(self.staleness_threshold_minutes)
            .ok()
            .and_then(chrono::TimeDelta::try_minutes)
    }

    /// Oldest accepted event timestamp at `now`, `None` when unbounded
    pub fn staleness_lower_bound(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Option<chrono::DateTime<chrono::Utc>> {
        self.staleness_threshold()
            .and_then(|threshold| now.checked_sub_signed(threshold))
    }

    /// Deterministic per-dataset topic
    pub fn dataset_topic(&self, dataset_id: &str) -> String {
        format!("{}{}", self.dataset_topic_prefix, dataset_id)
    }
}
