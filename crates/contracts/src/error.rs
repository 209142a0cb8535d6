//! Layered error definitions
//!
//! Categorized by source: config / broker / payload

use thiserror::Error;

/// Unified error type
#[derive(Debug, Error)]
pub enum ContractError {
    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },

    // ===== Broker Errors =====
    /// Broker unreachable or rejected the connection
    #[error("broker connection error: {message}")]
    BrokerConnection { message: String },

    /// Producer could not be opened
    #[error("producer creation failed for topic '{topic}': {message}")]
    ProducerCreation { topic: String, message: String },

    /// Subscription could not be created
    #[error("subscribe failed for '{subscription}': {message}")]
    Subscribe {
        subscription: String,
        message: String,
    },

    /// Publish was not confirmed by the broker
    #[error("publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// Acknowledgment was rejected
    #[error("acknowledge failed on '{subscription}': {message}")]
    Acknowledge {
        subscription: String,
        message: String,
    },

    /// Handle used after close
    #[error("{handle} is closed")]
    Closed { handle: String },

    // ===== Payload Errors =====
    /// Payload decode error
    #[error("payload decode error: {message}")]
    PayloadDecode { message: String },

    /// Payload encode error
    #[error("payload encode error: {message}")]
    PayloadEncode { message: String },

    // ===== General Errors =====
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl ContractError {
    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create broker connection error
    pub fn broker(message: impl Into<String>) -> Self {
        Self::BrokerConnection {
            message: message.into(),
        }
    }

    /// Create producer creation error
    pub fn producer_creation(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProducerCreation {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create subscribe error
    pub fn subscribe(subscription: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Subscribe {
            subscription: subscription.into(),
            message: message.into(),
        }
    }

    /// Create publish error
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create acknowledge error
    pub fn acknowledge(subscription: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Acknowledge {
            subscription: subscription.into(),
            message: message.into(),
        }
    }

    /// Create closed-handle error
    pub fn closed(handle: impl Into<String>) -> Self {
        Self::Closed {
            handle: handle.into(),
        }
    }

    /// Create payload decode error
    pub fn payload_decode(message: impl Into<String>) -> Self {
        Self::PayloadDecode {
            message: message.into(),
        }
    }
}
