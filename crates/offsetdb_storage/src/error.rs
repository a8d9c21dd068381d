//! Error types for storage operations.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The handle (or the store behind it) is closed.
    #[error("storage handle is closed")]
    Closed,

    /// The exclusive write lock could not be acquired in time.
    #[error("could not acquire write lock for `{label}` within {timeout:?}")]
    LockTimeout {
        /// Label of the operation that waited.
        label: String,
        /// The configured timeout.
        timeout: Duration,
    },
}

impl StorageError {
    /// Returns true when retrying the operation later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
