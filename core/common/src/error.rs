//! Common error types for Offsync.

use thiserror::Error;

/// Top-level error type for Offsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Target record is missing at execution time.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network or store temporarily unavailable.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Local and remote versions disagree.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A sync was requested while disconnected.
    #[error("Cannot sync while offline")]
    Offline,

    /// Storage backend operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Whether an operation that failed with this error may be attempted again.
    ///
    /// Missing targets and malformed input fail the same way on every attempt,
    /// so only unavailability-type errors are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::Storage(_) | Error::Io(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
