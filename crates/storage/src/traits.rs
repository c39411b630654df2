//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use updraft_core::ContentHash;

/// Content-addressed blob storage.
///
/// A hash maps to at most one blob. Writes are idempotent, and a blob
/// becomes visible only once fully written.
#[async_trait]
pub trait AssetStore: Send + Sync + 'static {
    /// Store `data` under `hash`.
    ///
    /// Fails with `HashMismatch` if `data` does not hash to `hash`.
    /// Returns `false` when the blob was already present.
    async fn put(&self, hash: &ContentHash, data: Bytes) -> StorageResult<bool>;

    /// Read a blob. Fails with `NotFound` if absent.
    async fn get(&self, hash: &ContentHash) -> StorageResult<Bytes>;

    /// Check if a blob exists.
    async fn contains(&self, hash: &ContentHash) -> StorageResult<bool>;

    /// Local path of a stored blob, for handing to the host.
    async fn locate(&self, hash: &ContentHash) -> StorageResult<PathBuf>;

    /// Delete a blob. Returns `false` if it was already gone.
    async fn remove(&self, hash: &ContentHash) -> StorageResult<bool>;

    /// List every stored hash.
    async fn list(&self) -> StorageResult<Vec<ContentHash>>;

    /// Delete every blob whose hash is not in `live`. Returns the number deleted.
    async fn reap(&self, live: &HashSet<ContentHash>) -> StorageResult<usize> {
        let mut deleted = 0;
        for hash in self.list().await? {
            if !live.contains(&hash) && self.remove(&hash).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Get the backend name for logging.
    fn backend_name(&self) -> &'static str;

    /// Check that the backend is reachable and writable.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
