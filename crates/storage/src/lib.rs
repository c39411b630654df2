//! Content-addressed asset storage for Updraft.
//!
//! This crate provides:
//! - The `AssetStore` trait: blobs keyed by SHA-256 content hash
//! - A local filesystem backend with two-level fan-out directories
//! - Atomic temp-file-then-rename writes so readers and the reaper never
//!   observe partial blobs

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::filesystem::FilesystemAssetStore;
pub use error::{StorageError, StorageResult};
pub use traits::AssetStore;

use std::sync::Arc;
use updraft_core::config::StorageConfig;

/// Create an asset store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn AssetStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemAssetStore::new(path).await?;
            Ok(Arc::new(backend))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;
    use updraft_core::ContentHash;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("assets"),
        };

        let store = from_config(&config).await.unwrap();
        let data = Bytes::from_static(b"hi");
        let hash = ContentHash::compute(&data);
        store.put(&hash, data).await.unwrap();
        assert!(store.contains(&hash).await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
        store.health_check().await.unwrap();
    }
}
