//! Update database test utilities.

use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;
use updraft_core::{ContentHash, Manifest, ManifestAsset, UpdateId};
use updraft_metadata::{MetadataResult, SqliteStore, UpdateDatabase};

pub const SCOPE: &str = "test-scope";

/// A test database that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<dyn UpdateDatabase>,
    pub(crate) sqlite_store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("updates.db");
        let store = Arc::new(SqliteStore::new(&db_path, None).await?);

        Ok(Self {
            store: store.clone(),
            sqlite_store: store,
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<dyn UpdateDatabase> {
        self.store.clone()
    }

    /// Raw pool for assertions the repository API does not expose.
    #[allow(dead_code)]
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Sqlite> {
        self.sqlite_store.pool()
    }
}

/// An asset entry whose hash is derived from `content`.
pub fn asset(key: &str, content: &[u8]) -> ManifestAsset {
    ManifestAsset {
        key: key.to_string(),
        hash: ContentHash::compute(content),
        url: Some(format!("https://cdn.test/{key}")),
        size: content.len() as u64,
        content_type: None,
        is_launch_asset: false,
    }
}

/// A manifest committed `offset_secs` after a fixed base time.
pub fn manifest(offset_secs: i64, assets: Vec<ManifestAsset>) -> Manifest {
    Manifest {
        id: UpdateId::new(),
        commit_time: OffsetDateTime::from_unix_timestamp(1_700_000_000 + offset_secs)
            .expect("valid timestamp"),
        runtime_version: "1.0.0".to_string(),
        assets,
        metadata: serde_json::Map::new(),
    }
}

pub fn body(manifest: &Manifest) -> String {
    manifest.to_json().expect("manifest serializes")
}
