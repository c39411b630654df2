//! Engine error types.

use std::time::Duration;
use updraft_core::{ContentHash, UpdateId};
use updraft_metadata::MetadataError;
use updraft_signer::SignerError;
use updraft_storage::StorageError;

/// Failure while loading a remote update.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with HTTP {status}")]
    Http { status: u16 },

    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    #[error("hash mismatch for asset {key}: expected {expected}, got {actual}")]
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for asset {key}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("update {0} is still missing assets after commit")]
    Incomplete(UpdateId),

    #[error("load cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Db(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LoadError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "network_timeout",
            Self::Http { .. } => "http_status",
            Self::ManifestInvalid(_) => "manifest_invalid",
            Self::HashMismatch { .. } => "hash_mismatch",
            Self::SizeMismatch { .. } => "size_mismatch",
            Self::Incomplete(_) => "incomplete",
            Self::Cancelled => "cancelled",
            Self::Db(_) => "db_error",
            Self::Storage(_) => "storage_error",
        }
    }

    /// Transport failures, timeouts and server errors are worth another try.
    /// Integrity failures are final for that artifact.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) => true,
            Self::Http { status } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_) | Self::Http { .. })
    }
}

/// Result type for loader operations.
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Failure while selecting or preparing an update to launch.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no launchable update for scope {scope_key}")]
    NoLaunchableUpdate { scope_key: String },

    #[error("update {update_id} is missing {} asset(s)", hashes.len())]
    AssetMissing {
        update_id: UpdateId,
        hashes: Vec<ContentHash>,
    },

    #[error("database error: {0}")]
    Db(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoLaunchableUpdate { .. } => "no_launchable_update",
            Self::AssetMissing { .. } => "asset_missing",
            Self::Db(_) => "db_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

/// Result type for launcher operations.
pub type LaunchResult<T> = std::result::Result<T, LaunchError>;

/// Top-level engine error.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("embedded update error: {0}")]
    Embedded(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("database error: {0}")]
    Db(#[from] MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("core error: {0}")]
    Core(#[from] updraft_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Embedded(_) => "embedded_error",
            Self::Load(e) => e.code(),
            Self::Launch(e) => e.code(),
            Self::Db(MetadataError::ProtectedUpdate { .. }) => "protected_update",
            Self::Db(_) => "db_error",
            Self::Storage(_) => "storage_error",
            Self::Signer(_) => "signer_error",
            Self::Core(_) => "core_error",
            Self::Io(_) => "io_error",
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
