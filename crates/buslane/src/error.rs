//! Error types for bus operations.

use std::time::Duration;
use thiserror::Error;

/// Comprehensive error type for all bus operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Queue already exists: {queue_name}")]
    QueueAlreadyExists { queue_name: String },

    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Message not found: {message_id} on queue {queue_name}")]
    MessageNotFound {
        message_id: String,
        queue_name: String,
    },

    #[error("Connection to {endpoint} failed: {message}")]
    ConnectionFailed { endpoint: String, message: String },

    #[error("Channel operation failed: {message}")]
    ChannelFailed { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Binding to topic '{topic}' failed after {attempts} attempts: {message}")]
    BindingFailed {
        topic: String,
        attempts: u32,
        message: String,
    },

    #[error("No provider registered for '{name}'")]
    UnknownProvider { name: String },

    #[error("Connection registry has been shut down")]
    RegistryClosed,

    #[error("Operation canceled")]
    Canceled,

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl BusError {
    /// Check if error is transient and the operation may be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueAlreadyExists { .. } => false,
            Self::QueueNotFound { .. } => false,
            Self::TopicNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::ChannelFailed { .. } => true,
            Self::Transport { .. } => true,
            Self::Store { .. } => true,
            Self::BindingFailed { .. } => false, // retry budget already spent
            Self::UnknownProvider { .. } => false,
            Self::RegistryClosed => false,
            Self::Canceled => false,
            Self::Configuration(_) => false,
            Self::Validation(_) => false,
        }
    }

    /// Get suggested retry delay for transient errors
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(5)),
            Self::ChannelFailed { .. } => Some(Duration::from_secs(5)),
            Self::Transport { .. } => Some(Duration::from_secs(5)),
            Self::Store { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }

    /// Build a transport error from any displayable cause
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Build a store error from any displayable cause
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BusError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
