//! # Broker
//!
//! 内存 broker 实现，用于无外部 broker 环境的测试与本地运行。
//!
//! Implements the `contracts` broker traits over partitioned, append-only
//! in-process logs:
//! - `Exclusive` subscriptions: one consumer owns the cursor
//! - `Shared` subscriptions: each message goes to exactly one attached consumer
//! - `Failover` subscriptions: partition `p` belongs to consumer `p % n`, the
//!   rest stand by; unacknowledged messages of a reassigned partition are
//!   redelivered in order to the new owner
//!
//! Failure injection (`fail_producer_creation`, `fail_publish`) and
//! per-topic counters make it usable as a test double.
//!
//! ## Usage Example
//!
//! ```ignore
//! use broker::InMemoryBroker;
//! use contracts::{BrokerClient, Producer, ProducerKey};
//!
//! let broker = InMemoryBroker::new();
//! let producer = broker.create_producer(&ProducerKey::new("telemetry")).await?;
//! producer.send(payload).await?;
//! ```

mod consumer;
mod memory;
mod producer;
mod topic;

pub use consumer::MemoryConsumer;
pub use memory::{BrokerStats, InMemoryBroker, MemoryBrokerConfig};
pub use producer::MemoryProducer;
