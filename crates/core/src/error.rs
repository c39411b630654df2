//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid update id: {0}")]
    InvalidUpdateId(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("invalid runtime version: {0}")]
    InvalidRuntimeVersion(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
