//! Error types for OffsetDB core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in offset index operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] offsetdb_storage::StorageError),

    /// Payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] offsetdb_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A framed record failed validation.
    #[error("corrupted record at position {position}: {message} (expected {expected}, actual {actual})")]
    CorruptedRecord {
        /// Description of the violation, including the record number when known.
        message: String,
        /// File position of the offending record.
        position: u64,
        /// The expected value (checksum, length or version).
        expected: i64,
        /// The value actually found.
        actual: i64,
    },

    /// The record stored for a key could not be read back.
    #[error("record {record_type}:{primary_key} is corrupted: {source}")]
    CorruptedKeyValueRecord {
        /// Record type of the key.
        record_type: i8,
        /// Primary key.
        primary_key: i64,
        /// The underlying failure.
        #[source]
        source: Box<CoreError>,
    },

    /// A read raced a write whose bytes are not fully on disk yet.
    #[error("record {record_type}:{primary_key} has not been written yet: {source}")]
    RecordNotYetWritten {
        /// Record type of the key.
        record_type: i8,
        /// Primary key.
        primary_key: i64,
        /// The failure observed after the soft flush.
        #[source]
        source: Box<CoreError>,
    },

    /// No pooled instance is available and the pool may not grow.
    #[error("pool of {handle} exhausted: all {max} instances are in use")]
    PoolExhausted {
        /// The configured maximum.
        max: usize,
        /// What the pool holds.
        handle: &'static str,
    },

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The index is closed.
    #[error("offset index is closed")]
    IndexClosed,

    /// Storage options are inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfiguration {
        /// Description of the problem.
        message: String,
    },

    /// A record type id is not registered.
    #[error("unknown record type {id}")]
    UnknownRecordType {
        /// The unknown id.
        id: i8,
    },
}

impl CoreError {
    /// Creates a corrupted record error.
    pub fn corrupted(
        message: impl Into<String>,
        position: u64,
        expected: i64,
        actual: i64,
    ) -> Self {
        Self::CorruptedRecord {
            message: message.into(),
            position,
            expected,
            actual,
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_configuration(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            message: message.into(),
        }
    }

    /// Returns true when the failure is transient and the call may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } => true,
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for the corruption family of errors.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptedRecord { .. } | Self::CorruptedKeyValueRecord { .. }
        )
    }
}
