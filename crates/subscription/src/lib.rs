//! # Subscription Manager
//!
//! 把 `(topics, name, mode)` 翻译成具体的 broker 订阅配置。
//!
//! | Mode | Kind | Name | Initial position |
//! |---|---|---|---|
//! | `Broadcast` | `Exclusive` | `{name}-{instance_id}` | Latest |
//! | `Competing` | `Shared` | `{name}` | Earliest |
//! | `Ordered` | `Failover` | `{name}` | Earliest |
//!
//! A subscription keeps its mode until closed. Subscribe failures are returned
//! to the caller as-is, there is no internal retry.

mod error;
mod manager;
mod stream;

pub use error::{Result, SubscribeError};
pub use manager::{SubscriptionManager, SubscriptionSettings};
pub use stream::message_stream;
