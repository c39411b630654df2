//! Storage error types.

use thiserror::Error;

/// Asset store errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("asset not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<updraft_core::Error> for StorageError {
    fn from(err: updraft_core::Error) -> Self {
        match err {
            updraft_core::Error::HashMismatch { expected, actual } => {
                Self::HashMismatch { expected, actual }
            }
            other => Self::Config(other.to_string()),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
