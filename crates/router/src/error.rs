//! Router error types

use subscription::SubscribeError;
use thiserror::Error;

/// Router-specific errors
#[derive(Debug, Error)]
pub enum RouterError {
    /// Global topic subscription failed
    #[error("failed to subscribe the global topic")]
    Subscribe(#[from] SubscribeError),

    /// Consumer was closed underneath the router
    #[error("consumer for '{subscription}' closed unexpectedly")]
    ConsumerClosed { subscription: String },

    /// Background task panicked
    #[error("router task '{task}' failed: {message}")]
    TaskFailed { task: String, message: String },

    /// Router stopped
    #[error("dataset router unhealthy: {reason}")]
    Unhealthy { reason: String },

    /// Invalid configuration
    #[error("invalid router config: {message}")]
    InvalidConfig { message: String },
}

impl RouterError {
    /// Create a task failure error
    pub fn task_failed(task: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
