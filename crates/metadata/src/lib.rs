//! Durable update database for Updraft.
//!
//! This crate provides the single source of truth for local update state:
//! - Updates, their assets and the join between them
//! - Readiness flips inside the same transaction as the last asset verification
//! - Keep flags and protected deletes
//! - Launch records and crash-loop counters
//! - A small per-scope key-value table

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::json_data::{
    DIAGNOSTICS_KEY, EXTRA_PARAMS_KEY, MANIFEST_FILTERS_KEY, SERVER_DEFINED_HEADERS_KEY,
};
pub use repos::{InsertedUpdate, JsonDataRepo, LaunchRepo, UpdateRepo};
pub use store::{SqliteStore, UpdateDatabase};

use std::sync::Arc;
use updraft_core::config::MetadataConfig;

/// Open an update database from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn UpdateDatabase>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs).await?;
            Ok(Arc::new(store) as Arc<dyn UpdateDatabase>)
        }
    }
}
