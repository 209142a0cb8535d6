//! # Contracts
//!
//! Frozen interface contracts (ICD) for the telemetry data-plane.
//! All business crates can only depend on this crate, reverse dependencies are prohibited.
//!
//! ## Delivery model
//! - Topics are partitioned, append-only logs reached through [`BrokerClient`]
//! - A [`MessageId`] is ordered within its partition and carries no arithmetic
//! - Subscriptions run in one [`SubscriptionMode`] for their whole lifetime

mod broker;
mod config;
mod error;
mod message;
mod sink;

pub use broker::*;
pub use config::*;
pub use error::*;
pub use message::*;
pub use sink::*;
