//! Error types for the carb_core library.

use crate::MeasurementHandle;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for carb_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Rejected input (negative macros, empty meal, limit violations)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Delete or replace targeted a handle the store doesn't hold
    #[error("Measurement not found: {0}")]
    NotFound(MeasurementHandle),

    /// Underlying persistence failed
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failures of the persistence layer (journal, device state, export)
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(StorageError::Io(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(StorageError::Json(e))
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Storage(StorageError::Csv(e))
    }
}

impl Error {
    /// Shorthand for building an `InvalidInput` error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// True for failures of the persistence layer
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Error::Storage(_))
    }
}
