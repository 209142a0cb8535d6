//! Data-plane orchestration module.

mod load;
mod orchestrator;
mod stats;

pub use load::{LoadReport, SyntheticLoadConfig};
pub use orchestrator::{Platform, PlatformOptions};
pub use stats::PlatformStats;
