//! Common error types for edgesync.

use thiserror::Error;

/// Top-level error type for edgesync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Network operation failed.
    #[error("Network error: {0}")]
    Network(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation queue is at capacity.
    #[error("Queue full: capacity {0} reached")]
    QueueFull(usize),

    /// A conflict needs an external actor to pick the winner.
    #[error("Manual resolution required for record {0}")]
    ManualResolutionRequired(String),

    /// An operation handler reported failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An operation did not complete in time.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Durable state could not be written.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
