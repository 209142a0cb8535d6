//! # Storage
//!
//! Columnar-store stand-ins implementing [`StorageSink`](contracts::StorageSink).
//!
//! - [`MemoryStore`]: in-process, queryable, switchable to "unavailable"
//! - [`JsonlStore`]: one JSON-lines file per dataset
//!
//! 两者都以 `event_id` 去重：重复投递 (broker redelivery) 不会产生重复记录。

mod file;
mod memory;

pub use file::{JsonlStore, JsonlStoreConfig};
pub use memory::MemoryStore;
