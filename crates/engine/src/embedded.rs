//! Embedded update initialization.

use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use updraft_core::config::EmbeddedConfig;
use updraft_core::{AssetStatus, Manifest, UpdateId};
use updraft_metadata::UpdateDatabase;
use updraft_storage::{AssetStore, StorageError};

/// Read and validate the bundled manifest. Returns it with its raw body.
pub async fn read_embedded_manifest(config: &EmbeddedConfig) -> EngineResult<(Manifest, String)> {
    let body = tokio::fs::read_to_string(&config.manifest_path)
        .await
        .map_err(|e| {
            EngineError::Embedded(format!(
                "cannot read {}: {e}",
                config.manifest_path.display()
            ))
        })?;
    let manifest = Manifest::from_json(body.as_bytes())
        .map_err(|e| EngineError::Embedded(format!("invalid embedded manifest: {e}")))?;
    Ok((manifest, body))
}

/// Ensure the update bundled with the host is installed and its blobs exist.
///
/// Copies any asset the store lacks from the bundle directory, verifying it
/// against the manifest, then installs the `Embedded` row. Safe to call on
/// every start: an already-installed bundle only has missing blobs restored.
/// A bundle with a new id replaces the previous embedded update.
pub async fn ensure_embedded_update(
    db: &dyn UpdateDatabase,
    store: &dyn AssetStore,
    commit_gate: &RwLock<()>,
    scope_key: &str,
    config: &EmbeddedConfig,
) -> EngineResult<UpdateId> {
    let (manifest, body) = read_embedded_manifest(config).await?;

    let _gate = commit_gate.read().await;
    let mut restored = 0usize;
    for asset in manifest.unique_assets() {
        if store.contains(&asset.hash).await? {
            continue;
        }

        let path = bundle_path(&config.assets_dir, &asset.key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| {
            EngineError::Embedded(format!("cannot read asset {}: {e}", path.display()))
        })?;
        if data.len() as u64 != asset.size {
            return Err(EngineError::Embedded(format!(
                "asset {} is {} bytes, manifest says {}",
                asset.key,
                data.len(),
                asset.size
            )));
        }

        store
            .put(&asset.hash, Bytes::from(data))
            .await
            .map_err(|e| match e {
                StorageError::HashMismatch { .. } => EngineError::Embedded(format!(
                    "asset {} does not match its manifest hash",
                    asset.key
                )),
                other => other.into(),
            })?;
        restored += 1;
    }

    let installed = db
        .install_embedded_update(scope_key, &manifest, &body)
        .await?;
    if !installed {
        // Blobs restored above may belong to rows a launch marked missing.
        for asset in manifest.unique_assets() {
            if db.asset_status(&asset.hash).await? != Some(AssetStatus::Verified) {
                db.set_asset_status(&asset.hash, AssetStatus::Verified)
                    .await?;
            }
        }
        tracing::debug!(update_id = %manifest.id, restored, "Embedded update already installed");
    } else {
        tracing::info!(update_id = %manifest.id, restored, "Embedded update installed");
    }

    Ok(manifest.id)
}

/// Resolve an asset key inside the bundle directory.
fn bundle_path(dir: &Path, key: &str) -> EngineResult<PathBuf> {
    let relative = Path::new(key);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(EngineError::Embedded(format!(
            "asset key {key} escapes the bundle directory"
        )));
    }
    Ok(dir.join(relative))
}
