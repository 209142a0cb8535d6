//! # Producer Pool
//!
//! 按 [`ProducerKey`](contracts::ProducerKey) 缓存的 producer 池。
//!
//! - 容量上限 + 空闲 TTL (LRU 淘汰)
//! - 同 key 并发 `get` 合并为一次创建 (single-flight)，创建错误不缓存
//! - 淘汰的 producer 在后台任务中异步关闭，不阻塞 `get`
//! - `shutdown()` 清空缓存并等待所有关闭完成
//!
//! 调用方不持有关闭权：producer 的生命周期完全由池管理。
//!
//! ## Usage Example
//!
//! ```ignore
//! use producer_pool::ProducerPool;
//!
//! let pool = ProducerPool::new(broker, &config.producer_pool);
//! let producer = pool.get(&ProducerKey::new("dataset-weather")).await?;
//! producer.send(payload).await?;
//!
//! // 退出前
//! pool.shutdown().await;
//! ```

mod error;
mod pool;

pub use error::{PoolError, Result};
pub use pool::{PoolStats, ProducerPool};
