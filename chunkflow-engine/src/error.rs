//! Error types for chunkflow-engine
//!
//! Two layers:
//! - [`ChunkError`]: outcome of a single fetch+enhance task. Cloneable so
//!   every waiter attached to an in-flight task observes the same failure.
//! - [`Error`]: caller-facing errors from coordinator and store operations.

use chunkflow_common::ChunkErrorKind;
use thiserror::Error;

/// Failure of one chunk task
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Task exceeded its tiered deadline
    #[error("Chunk task timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// Requested source range does not exist
    #[error("Source range not found")]
    SourceNotFound,

    /// Source exists but cannot be read
    #[error("Permission denied reading source")]
    PermissionDenied,

    /// Fetched or enhanced data was unusable
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Work abandoned before it produced a result
    #[error("Chunk task cancelled")]
    Cancelled,
}

impl ChunkError {
    pub fn kind(&self) -> ChunkErrorKind {
        match self {
            ChunkError::Timeout { .. } => ChunkErrorKind::Timeout,
            ChunkError::SourceNotFound => ChunkErrorKind::SourceNotFound,
            ChunkError::PermissionDenied => ChunkErrorKind::PermissionDenied,
            ChunkError::DecodeFailure(_) => ChunkErrorKind::DecodeFailure,
            ChunkError::Cancelled => ChunkErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Classify collaborator I/O failures into the chunk taxonomy
impl From<std::io::Error> for ChunkError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ChunkError::SourceNotFound,
            std::io::ErrorKind::PermissionDenied => ChunkError::PermissionDenied,
            _ => ChunkError::DecodeFailure(err.to_string()),
        }
    }
}

/// Main error type for chunkflow-engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration / input errors from the common crate
    #[error(transparent)]
    Common(#[from] chunkflow_common::Error),

    /// Cold-store index errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation needs an active track but none is set
    #[error("No active track")]
    NoActiveTrack,

    /// Coordinator is shutting down or was never started
    #[error("Stream coordinator is shutting down")]
    ShuttingDown,

    /// A caller-facing wait did not complete in time
    ///
    /// Carries no chunk-level cause.
    #[error("Timed out after {waited_ms}ms waiting for chunk")]
    WaitTimeout { waited_ms: u64 },
}

/// Convenience Result type using chunkflow-engine Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_classified() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ChunkError::from(not_found), ChunkError::SourceNotFound);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(ChunkError::from(denied), ChunkError::PermissionDenied);

        let other = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        assert!(matches!(ChunkError::from(other), ChunkError::DecodeFailure(_)));
    }

    #[test]
    fn retryability_follows_kind() {
        assert!(ChunkError::DecodeFailure("x".into()).is_retryable());
        assert!(!ChunkError::SourceNotFound.is_retryable());
        assert!(!ChunkError::Timeout { waited_ms: 10 }.is_retryable());
    }

    #[test]
    fn wait_timeout_hides_cause() {
        let err = Error::WaitTimeout { waited_ms: 5000 };
        let msg = err.to_string();
        assert!(msg.contains("5000"));
        assert!(!msg.contains("not found"));
    }
}
