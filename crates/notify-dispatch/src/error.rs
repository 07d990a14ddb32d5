//! Dispatch error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dispatch result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Dispatch error type.
///
/// Every failure surfaced by the core, whether raised by the dispatcher itself
/// or classified by a delivery adapter, ends up as one of these variants.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Transient delivery error: {message}")]
    TransientDelivery {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    #[error("Circuit open for {destination}, retry after {retry_after:?}")]
    CircuitOpen {
        destination: String,
        retry_after: Duration,
    },

    #[error("Dispatch cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, machine-readable reason code for an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    TransientDeliveryError,
    PermanentDeliveryError,
    CircuitOpen,
    Cancelled,
    ConfigurationError,
    SerializationError,
    IoError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::TransientDeliveryError => "transient_delivery_error",
            Self::PermanentDeliveryError => "permanent_delivery_error",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::ConfigurationError => "configuration_error",
            Self::SerializationError => "serialization_error",
            Self::IoError => "io_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDelivery {
            message: msg.into(),
            retry_after: None,
        }
    }

    pub fn transient_with_retry_after(msg: impl Into<String>, retry_after: Duration) -> Self {
        Self::TransientDelivery {
            message: msg.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentDelivery(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Stable reason code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::TransientDelivery { .. } => ErrorCode::TransientDeliveryError,
            Self::PermanentDelivery(_) => ErrorCode::PermanentDeliveryError,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::Serialization(_) => ErrorCode::SerializationError,
            Self::Io(_) => ErrorCode::IoError,
        }
    }

    /// Whether the same request may succeed if attempted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientDelivery { .. })
    }

    /// Hint for when the operation may be attempted again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientDelivery { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}
