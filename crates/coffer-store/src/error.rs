//! Error types for the content store.

use thiserror::Error;

use crate::blob::{BlobKind, UnpackedKind};
use crate::id::ContentId;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The requested blob does not exist.
    #[error("{kind} blob not found: {id}")]
    NotFound {
        /// Kind of the missing blob.
        kind: BlobKind,
        /// The ID that was not found.
        id: ContentId,
    },

    /// The requested unpacked object does not exist.
    #[error("{kind} not found: {id}")]
    UnpackedNotFound {
        /// Kind of the missing object.
        kind: UnpackedKind,
        /// The ID that was not found.
        id: ContentId,
    },

    /// The announced length does not match the bytes handed over.
    #[error("Length mismatch for {id}: announced {expected} bytes, got {actual}")]
    LengthMismatch {
        /// The blob ID.
        id: ContentId,
        /// Announced length.
        expected: u64,
        /// Length of the data actually passed.
        actual: u64,
    },

    /// Stored bytes no longer hash to their ID.
    #[error("Corrupted object {id}: {reason}")]
    Corrupt {
        /// The ID of the corrupted object.
        id: ContentId,
        /// Description of the corruption.
        reason: String,
    },

    /// A content ID could not be parsed.
    #[error("Invalid content ID {input:?}: {reason}")]
    InvalidId {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },

    /// The backend refused the operation.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<bincode::Error> for StoreError {
    fn from(err: bincode::Error) -> Self {
        StoreError::SerializationError {
            reason: err.to_string(),
        }
    }
}
