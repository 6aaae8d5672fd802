//! Error types for drover
//!
//! Provides structured error handling for the pipeline runtime, the store
//! adapters and the HTTP executor.

use thiserror::Error;

/// Result type alias for the drover runtime
pub type Result<T> = std::result::Result<T, DroverError>;

/// Result type alias for store adapter operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Main error type for the drover runtime
#[derive(Error, Debug)]
pub enum DroverError {
    /// Missing or malformed configuration (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Store could not be reached or refused the operation
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Column binding or payload decoding failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// A pipeline stage terminated abnormally
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: &'static str, message: String },

    /// Store adapter error
    #[error(transparent)]
    Store(StoreError),
}

impl DroverError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stage error
    pub fn stage(stage: &'static str, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: msg.into(),
        }
    }
}

/// Errors raised by the `Source` / `Sink` store adapters.
///
/// Adapters never retry on their own; callers decide based on
/// [`StoreError::is_retryable`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport failure, timeout or server unavailable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Column-to-field mismatch while binding rows
    #[error("decode error: {0}")]
    Decode(String),

    /// The server rejected the statement
    #[error("query error: {0}")]
    Query(String),

    /// Identifier or DDL rejected before reaching the server
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

impl From<StoreError> for DroverError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Decode(msg) => Self::Decode(msg),
            other => Self::Store(other),
        }
    }
}
