//! Command implementations.

mod run;
mod validate;

pub use run::run_platform;
pub use validate::run_validate;
