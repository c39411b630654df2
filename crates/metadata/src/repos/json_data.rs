//! Key-value scope repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Well-known keys.
pub const MANIFEST_FILTERS_KEY: &str = "manifestFilters";
pub const SERVER_DEFINED_HEADERS_KEY: &str = "serverDefinedHeaders";
pub const EXTRA_PARAMS_KEY: &str = "extraParams";
pub const DIAGNOSTICS_KEY: &str = "diagnostics";

/// Small JSON values stored per scope.
#[async_trait]
pub trait JsonDataRepo: Send + Sync {
    async fn get_json_data(&self, scope_key: &str, key: &str) -> MetadataResult<Option<String>>;

    async fn set_json_data(&self, scope_key: &str, key: &str, value: &str) -> MetadataResult<()>;

    /// Write several keys in one transaction.
    async fn set_json_data_many(
        &self,
        scope_key: &str,
        values: &BTreeMap<String, String>,
    ) -> MetadataResult<()>;

    async fn delete_json_data(&self, scope_key: &str, key: &str) -> MetadataResult<bool>;

    /// Append `item` (a JSON value) to the JSON array stored under `key`,
    /// creating it if absent. The oldest entries are dropped beyond
    /// `max_len`. Returns the new array length.
    async fn append_json_list(
        &self,
        scope_key: &str,
        key: &str,
        item: &str,
        max_len: usize,
    ) -> MetadataResult<usize>;

    /// Read and delete a value in one statement. A value is returned to at
    /// most one caller.
    async fn take_json_data(&self, scope_key: &str, key: &str) -> MetadataResult<Option<String>>;
}
