//! In-memory producer handle

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use contracts::{ContractError, MessageId, Producer, ProducerKey};
use tracing::{debug, instrument};

use crate::memory::Shared;

/// Producer bound to one topic
///
/// Unkeyed sends rotate over partitions, keyed sends hash to a fixed partition.
#[derive(Debug)]
pub struct MemoryProducer {
    shared: Arc<Shared>,
    key: ProducerKey,
    closed: AtomicBool,
    next_partition: AtomicU32,
}

impl MemoryProducer {
    pub(crate) fn new(shared: Arc<Shared>, key: ProducerKey) -> Self {
        Self {
            shared,
            key,
            closed: AtomicBool::new(false),
            next_partition: AtomicU32::new(0),
        }
    }

    /// Key this producer was created for
    pub fn key(&self) -> &ProducerKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, key: Option<&str>, content: Bytes) -> Result<MessageId, ContractError> {
        if self.is_closed() {
            return Err(ContractError::closed(format!("producer for '{}'", self.key.topic)));
        }
        let round_robin = self.next_partition.fetch_add(1, Ordering::Relaxed);
        self.shared.publish(&self.key.topic, key, content, round_robin)
    }
}

impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.key.topic
    }

    #[instrument(
        name = "memory_producer_send",
        skip(self, content),
        fields(topic = %self.key.topic, bytes = content.len())
    )]
    async fn send(&self, content: Bytes) -> Result<MessageId, ContractError> {
        self.publish(None, content)
    }

    #[instrument(
        name = "memory_producer_send_keyed",
        skip(self, content),
        fields(topic = %self.key.topic, bytes = content.len())
    )]
    async fn send_keyed(&self, key: &str, content: Bytes) -> Result<MessageId, ContractError> {
        self.publish(Some(key), content)
    }

    async fn close(&self) -> Result<(), ContractError> {
        // 幂等：只计一次关闭
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.record_producer_closed(&self.key.topic);
            debug!(topic = %self.key.topic, "producer closed");
        }
        Ok(())
    }
}
