//! Error types for the ratesync service.

use thiserror::Error;

/// Main error type for ratesync operations.
#[derive(Error, Debug)]
pub enum RateSyncError {
    /// The tenant key has never been configured.
    #[error("key not configured: {0}")]
    KeyNotConfigured(String),

    /// A configuration payload failed validation.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfiguration {
        /// The offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// The durable store could not be reached or rejected the command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Persisted or published state could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Service configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateSyncError {
    /// Shorthand for a field-level validation failure.
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<redis::RedisError> for RateSyncError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for RateSyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type alias for ratesync operations.
pub type Result<T> = std::result::Result<T, RateSyncError>;
