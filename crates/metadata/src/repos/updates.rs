//! Update and asset repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use updraft_core::{Asset, AssetStatus, ContentHash, Manifest, Update, UpdateId, UpdateStatus};

/// Result of inserting a pending update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertedUpdate {
    pub id: UpdateId,
    /// `false` when a row for this id already existed.
    pub inserted: bool,
    /// Status after the insert transaction.
    pub status: UpdateStatus,
}

/// Repository for updates, their assets and the join between them.
#[async_trait]
pub trait UpdateRepo: Send + Sync {
    /// Insert a `Pending` update with its asset rows.
    ///
    /// `json_data` entries are written to the scope's key-value table in the
    /// same transaction. Assets already `Verified` are linked as-is; if every
    /// asset is verified the update is `Ready` before the transaction commits.
    ///
    /// A second insert of an existing id is not an error: it returns
    /// `inserted: false` and the stored status.
    async fn insert_pending_update(
        &self,
        scope_key: &str,
        manifest: &Manifest,
        manifest_body: &str,
        json_data: &BTreeMap<String, String>,
    ) -> MetadataResult<InsertedUpdate>;

    /// Install the update shipped with the host binary.
    ///
    /// Assets are recorded as `Verified`. Any previous `Embedded` update for
    /// the scope is demoted in the same transaction. Returns `false` if this
    /// id was already the embedded update.
    async fn install_embedded_update(
        &self,
        scope_key: &str,
        manifest: &Manifest,
        manifest_body: &str,
    ) -> MetadataResult<bool>;

    /// Mark an asset verified. Every update whose last unverified asset this
    /// was flips to `Ready` in the same transaction.
    ///
    /// Returns `true` if `update_id` became `Ready`.
    async fn mark_asset_verified(
        &self,
        update_id: UpdateId,
        hash: &ContentHash,
    ) -> MetadataResult<bool>;

    /// Current download status of an asset, if any update references it.
    async fn asset_status(&self, hash: &ContentHash) -> MetadataResult<Option<AssetStatus>>;

    /// Set an asset's download status. Moving away from `Verified` demotes
    /// `Ready` updates that reference it.
    async fn set_asset_status(&self, hash: &ContentHash, status: AssetStatus)
    -> MetadataResult<()>;

    /// Reset assets whose blobs vanished to `Pending` and demote the `Ready`
    /// updates referencing them. Returns the demoted update ids.
    async fn mark_missing_assets(&self, hashes: &[ContentHash]) -> MetadataResult<Vec<UpdateId>>;

    /// All updates for a scope, newest `commit_time` first, ties by id.
    async fn updates_for_scope(&self, scope_key: &str) -> MetadataResult<Vec<Update>>;

    async fn get_update(&self, id: UpdateId) -> MetadataResult<Option<Update>>;

    /// Assets referenced by an update, ordered by key.
    async fn assets_for_update(&self, id: UpdateId) -> MetadataResult<Vec<Asset>>;

    async fn set_keep_flag(&self, id: UpdateId, keep: bool) -> MetadataResult<()>;

    /// Make `id` the scope's launched update and unmark the previous one.
    /// Host-set `keep` flags are left alone.
    async fn mark_launched(&self, scope_key: &str, id: UpdateId) -> MetadataResult<()>;

    /// Count a finished launch. A success resets the consecutive failure count.
    async fn increment_launch_outcome(
        &self,
        id: UpdateId,
        succeeded: bool,
    ) -> MetadataResult<Update>;

    /// Touch `last_accessed`.
    async fn mark_update_accessed(&self, id: UpdateId) -> MetadataResult<()>;

    /// Updates in the scope that have failed at least once, newest first.
    async fn recent_update_ids_with_failed_launch(
        &self,
        scope_key: &str,
        limit: usize,
    ) -> MetadataResult<Vec<UpdateId>>;

    /// Delete updates and any asset rows no longer referenced.
    ///
    /// Fails with `ProtectedUpdate` and deletes nothing if any id is kept or
    /// embedded. The check runs inside the delete transaction.
    async fn delete_updates(&self, ids: &HashSet<UpdateId>) -> MetadataResult<usize>;

    /// Every asset hash referenced by a stored update.
    async fn live_asset_hashes(&self) -> MetadataResult<HashSet<ContentHash>>;
}
