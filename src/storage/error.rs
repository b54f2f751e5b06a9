//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer. Absence of a key
//! is not an error: lookups return `Ok(None)`.

use crate::query::QueryError;
use thiserror::Error;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed (open, flush, close of the backing image)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Document could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stored bytes could not be turned back into a document
    #[error("Decode error: {0}")]
    Decode(String),

    /// Backing image is damaged beyond the recoverable prefix
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// Document or argument rejected before anything was written
    #[error("Validation error: {0}")]
    Validation(String),

    /// Mutation lock was already held
    #[error("DBLock: {0}")]
    Lock(String),

    /// Filter could not be parsed
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    /// Engine was closed or its worker is gone
    #[error("Engine is closed")]
    Closed,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
