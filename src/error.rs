//! Error types for the Floodgate admission layer.

use thiserror::Error;

/// Main error type for Floodgate configuration and setup.
///
/// Request-path rejections are not represented here; see
/// [`AdmissionError`](crate::middleware::AdmissionError).
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// An operation limit that cannot be turned into a bucket
    #[error("Invalid limit for operation '{operation}': {reason}")]
    InvalidSpec { operation: String, reason: String },

    /// The same operation appears twice in one configuration batch
    #[error("Operation '{0}' is configured more than once")]
    DuplicateOperation(String),

    /// Errors from the layered configuration loader
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
