//! SubscriptionManager implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    BrokerClient, ContentType, InitialPosition, PlatformConfig, SubscriptionConfig,
    SubscriptionKind, SubscriptionMode,
};
use tracing::{info, instrument};

use crate::error::{Result, SubscribeError};

/// Consumer-side settings shared by every subscription of a process
#[derive(Debug, Clone)]
pub struct SubscriptionSettings {
    /// Injected process identity (never derived from the hostname)
    pub instance_id: String,
    pub ack_group_time: Duration,
    pub max_unacked_messages: usize,
}

impl SubscriptionSettings {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ack_group_time: Duration::ZERO,
            max_unacked_messages: 0,
        }
    }

    pub fn from_config(config: &PlatformConfig) -> Self {
        Self {
            instance_id: config.instance_id.clone(),
            ack_group_time: config.broker.ack_group_time(),
            max_unacked_messages: config.broker.max_unacked_messages,
        }
    }
}

/// Translates delivery modes into broker subscriptions
pub struct SubscriptionManager<B: BrokerClient> {
    broker: B,
    settings: SubscriptionSettings,
    next_consumer: AtomicU64,
}

impl<B: BrokerClient> SubscriptionManager<B> {
    pub fn new(broker: B, settings: SubscriptionSettings) -> Self {
        Self {
            broker,
            settings,
            next_consumer: AtomicU64::new(0),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.settings.instance_id
    }

    /// Concrete configuration for `mode`
    ///
    /// Broadcast names embed the instance id so every process owns its own cursor.
    pub fn subscription_config(
        &self,
        topics: &[String],
        name: &str,
        content_type: ContentType,
        mode: SubscriptionMode,
    ) -> Result<SubscriptionConfig> {
        if name.is_empty() {
            return Err(SubscribeError::Invalid {
                name: name.to_string(),
                message: "subscription name is empty".to_string(),
            });
        }
        if topics.is_empty() || topics.iter().any(|t| t.is_empty()) {
            return Err(SubscribeError::Invalid {
                name: name.to_string(),
                message: "at least one non-empty topic is required".to_string(),
            });
        }

        let (kind, subscription_name, initial_position) = match mode {
            SubscriptionMode::Broadcast => (
                SubscriptionKind::Exclusive,
                format!("{}-{}", name, self.settings.instance_id),
                InitialPosition::Latest,
            ),
            SubscriptionMode::Competing => (
                SubscriptionKind::Shared,
                name.to_string(),
                InitialPosition::Earliest,
            ),
            SubscriptionMode::Ordered => (
                SubscriptionKind::Failover,
                name.to_string(),
                InitialPosition::Earliest,
            ),
        };

        let seq = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        Ok(SubscriptionConfig {
            topics: topics.to_vec(),
            subscription_name,
            consumer_name: format!("{}-{}-{}", name, self.settings.instance_id, seq),
            kind,
            initial_position,
            content_type,
            ack_group_time: self.settings.ack_group_time,
            max_unacked_messages: self.settings.max_unacked_messages,
        })
    }

    /// Subscribe to `topics` in `mode`
    ///
    /// # Errors
    /// [`SubscribeError`] if the arguments are invalid or the broker refuses;
    /// callers treat it as fatal.
    #[instrument(
        name = "subscription_subscribe",
        skip_all,
        fields(name = %name, ?mode, topics = topics.len())
    )]
    pub async fn subscribe(
        &self,
        topics: &[String],
        name: &str,
        content_type: ContentType,
        mode: SubscriptionMode,
    ) -> Result<Arc<B::Consumer>> {
        let config = self.subscription_config(topics, name, content_type, mode)?;
        let subscription_name = config.subscription_name.clone();

        let consumer = self
            .broker
            .create_consumer(config)
            .await
            .map_err(|source| SubscribeError::Broker {
                name: subscription_name.clone(),
                source,
            })?;

        info!(subscription = %subscription_name, ?mode, "subscribed");
        Ok(Arc::new(consumer))
    }
}
