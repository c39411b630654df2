//! Update database error types.

use thiserror::Error;
use updraft_core::UpdateId;

/// Format protected ids for display, capping at MAX_DISPLAYED to keep logs short.
fn format_ids(ids: &[UpdateId]) -> String {
    const MAX_DISPLAYED: usize = 5;
    let sample: Vec<String> = ids.iter().take(MAX_DISPLAYED).map(|id| id.to_string()).collect();
    if ids.len() <= MAX_DISPLAYED {
        format!("[{}]", sample.join(", "))
    } else {
        format!("[{}] (and {} more)", sample.join(", "), ids.len() - MAX_DISPLAYED)
    }
}

/// Update database operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A delete targeted updates that are kept or embedded. Nothing was deleted.
    #[error("refusing to delete {} protected update(s): {}", .ids.len(), format_ids(.ids))]
    ProtectedUpdate { ids: Vec<UpdateId> },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("corrupt row: {0}")]
    Corrupt(#[from] updraft_core::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl MetadataError {
    pub fn is_protected(&self) -> bool {
        matches!(self, Self::ProtectedUpdate { .. })
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
