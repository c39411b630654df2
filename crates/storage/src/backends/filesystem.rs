//! Local filesystem asset store.

use crate::error::{StorageError, StorageResult};
use crate::traits::AssetStore;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use updraft_core::ContentHash;
use uuid::Uuid;

/// Marker in the file names of in-flight writes.
const TEMP_MARKER: &str = ".tmp.";

/// Temp files older than this are leftovers from interrupted writes.
const STALE_TEMP_AGE: Duration = Duration::from_secs(60 * 60);

/// Filesystem asset store.
///
/// Blobs live at `root/ab/cd/abcd...` where `abcd...` is the hex hash.
pub struct FilesystemAssetStore {
    root: PathBuf,
}

/// Result of walking the fan-out tree.
#[derive(Default)]
struct Scan {
    blobs: Vec<(ContentHash, PathBuf)>,
    stale_temps: Vec<PathBuf>,
}

impl FilesystemAssetStore {
    /// Create a new filesystem store, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.to_object_key())
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Walk the two fan-out levels and classify what we find.
    ///
    /// In-flight temp files are never reported as blobs. Anything that does
    /// not look like a blob or a temp file is ignored.
    async fn scan(&self) -> StorageResult<Scan> {
        let mut scan = Scan::default();
        let now = SystemTime::now();

        for first in subdirs(&self.root).await? {
            for second in subdirs(&first).await? {
                let (Some(l1), Some(l2)) = (dir_name(&first), dir_name(&second)) else {
                    continue;
                };
                let mut entries = fs::read_dir(&second).await?;
                while let Some(entry) = entries.next_entry().await? {
                    // file_type() does not follow symlinks
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.contains(TEMP_MARKER) {
                        let modified = entry.metadata().await?.modified().ok();
                        let age = modified.and_then(|m| now.duration_since(m).ok());
                        if age.is_some_and(|age| age > STALE_TEMP_AGE) {
                            scan.stale_temps.push(entry.path());
                        }
                        continue;
                    }
                    if name.len() != 64 || name[..2] != l1 || name[2..4] != l2 {
                        continue;
                    }
                    if let Ok(hash) = ContentHash::from_hex(&name) {
                        scan.blobs.push((hash, entry.path()));
                    }
                }
            }
        }

        Ok(scan)
    }
}

async fn subdirs(dir: &Path) -> StorageResult<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(dirs),
        Err(e) => return Err(StorageError::Io(e)),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() && entry.file_name().len() == 2 {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().to_string())
}

fn map_not_found(hash: &ContentHash, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(hash.to_hex())
    } else {
        StorageError::Io(e)
    }
}

/// Hash off the async runtime; assets can be tens of megabytes.
async fn compute_hash(data: Bytes) -> StorageResult<ContentHash> {
    tokio::task::spawn_blocking(move || ContentHash::compute(&data))
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}"))))
}

#[async_trait]
impl AssetStore for FilesystemAssetStore {
    #[instrument(skip(self, data), fields(backend = "filesystem", hash = %hash, size = data.len()))]
    async fn put(&self, hash: &ContentHash, data: Bytes) -> StorageResult<bool> {
        let actual = compute_hash(data.clone()).await?;
        if actual != *hash {
            return Err(StorageError::HashMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }

        let path = self.blob_path(hash);
        if fs::try_exists(&path).await? {
            return Ok(false);
        }
        self.ensure_parent(&path).await?;

        // Unique temp name so concurrent writers of the same hash never collide.
        // The final rename is atomic, so the blob appears fully written or not at all.
        let temp_path = path.with_file_name(format!(
            "{}{}{}",
            hash.to_hex(),
            TEMP_MARKER,
            Uuid::new_v4()
        ));
        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, hash: &ContentHash) -> StorageResult<Bytes> {
        let data = fs::read(self.blob_path(hash))
            .await
            .map_err(|e| map_not_found(hash, e))?;
        let data = Bytes::from(data);

        let actual = compute_hash(data.clone()).await?;
        if actual != *hash {
            tracing::warn!(hash = %hash, actual = %actual, "Stored blob is corrupt");
            return Err(StorageError::HashMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(data)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn contains(&self, hash: &ContentHash) -> StorageResult<bool> {
        fs::try_exists(self.blob_path(hash))
            .await
            .map_err(StorageError::Io)
    }

    async fn locate(&self, hash: &ContentHash) -> StorageResult<PathBuf> {
        let path = self.blob_path(hash);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::NotFound(hash.to_hex())),
            Err(e) => Err(map_not_found(hash, e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn remove(&self, hash: &ContentHash) -> StorageResult<bool> {
        match fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self) -> StorageResult<Vec<ContentHash>> {
        Ok(self
            .scan()
            .await?
            .blobs
            .into_iter()
            .map(|(hash, _)| hash)
            .collect())
    }

    #[instrument(skip(self, live), fields(backend = "filesystem", live = live.len()))]
    async fn reap(&self, live: &HashSet<ContentHash>) -> StorageResult<usize> {
        let scan = self.scan().await?;

        let mut deleted = 0;
        for (hash, path) in scan.blobs {
            if live.contains(&hash) {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        for temp in &scan.stale_temps {
            if let Err(e) = fs::remove_file(temp).await {
                tracing::debug!(path = %temp.display(), error = %e, "Failed to remove stale temp file");
            }
        }

        tracing::debug!(
            deleted,
            stale_temps = scan.stale_temps.len(),
            "Asset store reap complete"
        );
        Ok(deleted)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("asset root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("asset root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
