//! Error types for Ratekeeper.

use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Invalid limiter or storage configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The identifier could not be derived from the request source
    #[error("Key extraction error: {0}")]
    KeyExtraction(String),

    /// Counter storage failures that were not absorbed by the storage layer
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The limiter was disposed before the operation completed
    #[error("Rate limiter has been disposed")]
    Disposed,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RatekeeperError {
    fn from(err: config::ConfigError) -> Self {
        RatekeeperError::Config(err.to_string())
    }
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
