//! Launcher: picks the update to run and resolves its assets on disk.
//!
//! The launcher never touches the network. When the chosen update's blobs
//! have vanished it demotes that update and falls back to the next candidate.

use crate::error::{LaunchError, LaunchResult};
use crate::metrics;
use crate::selection::LauncherSelectionPolicy;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::instrument;
use updraft_core::{ContentHash, SelectionFilters, Update, UpdateId, UpdateStatus};
use updraft_metadata::UpdateDatabase;
use updraft_storage::AssetStore;
use uuid::Uuid;

/// Everything a host needs to run an update.
#[derive(Clone, Debug, Serialize)]
pub struct LaunchDescriptor {
    /// Launch record to report the outcome against.
    pub launch_id: Uuid,
    pub update_id: UpdateId,
    pub scope_key: String,
    pub status: UpdateStatus,
    /// Local blob path for each asset key.
    pub asset_paths: BTreeMap<String, PathBuf>,
    /// Content hash for each asset key. Keys sharing a blob share a hash.
    pub asset_hashes: BTreeMap<String, ContentHash>,
    pub launch_asset: Option<PathBuf>,
    pub manifest_body: String,
}

/// A successful launch decision plus the candidates skipped on the way.
#[derive(Debug)]
pub struct LaunchSelection {
    pub descriptor: LaunchDescriptor,
    /// `AssetMissing` for every update passed over because blobs vanished.
    pub skipped: Vec<LaunchError>,
}

enum Resolved {
    Complete {
        asset_paths: BTreeMap<String, PathBuf>,
        asset_hashes: BTreeMap<String, ContentHash>,
        launch_asset: Option<PathBuf>,
    },
    Missing(Vec<ContentHash>),
}

pub struct Launcher {
    db: Arc<dyn UpdateDatabase>,
    store: Arc<dyn AssetStore>,
    policy: Arc<dyn LauncherSelectionPolicy>,
}

impl Launcher {
    pub fn new(
        db: Arc<dyn UpdateDatabase>,
        store: Arc<dyn AssetStore>,
        policy: Arc<dyn LauncherSelectionPolicy>,
    ) -> Self {
        Self { db, store, policy }
    }

    /// The update the policy would launch, without side effects.
    pub fn select<'a>(
        &self,
        updates: &'a [Update],
        runtime_version: &str,
        filters: &SelectionFilters,
        excluded: &HashSet<UpdateId>,
    ) -> Option<&'a Update> {
        let candidates: Vec<Update> = updates
            .iter()
            .filter(|u| !excluded.contains(&u.id))
            .cloned()
            .collect();
        let id = self
            .policy
            .select_launchable(&candidates, runtime_version, filters)?;
        updates.iter().find(|u| u.id == id)
    }

    /// Pick, resolve and begin a launch.
    ///
    /// The chosen update becomes the scope's launched update, which protects
    /// it from reaping, its access time is bumped and an `InProgress` launch
    /// record is opened. Keep flags are not touched.
    #[instrument(skip(self, filters, excluded))]
    pub async fn launch(
        &self,
        scope_key: &str,
        runtime_version: &str,
        filters: &SelectionFilters,
        excluded: &HashSet<UpdateId>,
    ) -> LaunchResult<LaunchSelection> {
        let updates = self.db.updates_for_scope(scope_key).await?;
        let mut excluded = excluded.clone();
        let mut skipped = Vec::new();

        let (update, asset_paths, asset_hashes, launch_asset) = loop {
            let Some(update) = self.select(&updates, runtime_version, filters, &excluded) else {
                return Err(LaunchError::NoLaunchableUpdate {
                    scope_key: scope_key.to_string(),
                });
            };

            match self.resolve_assets(update).await? {
                Resolved::Complete {
                    asset_paths,
                    asset_hashes,
                    launch_asset,
                } => break (update, asset_paths, asset_hashes, launch_asset),
                Resolved::Missing(hashes) => {
                    let demoted = self.db.mark_missing_assets(&hashes).await?;
                    metrics::LAUNCH_FALLBACKS.inc();
                    tracing::warn!(
                        update_id = %update.id,
                        missing = hashes.len(),
                        demoted = demoted.len(),
                        "Update assets missing, falling back"
                    );
                    excluded.insert(update.id);
                    skipped.push(LaunchError::AssetMissing {
                        update_id: update.id,
                        hashes,
                    });
                }
            }
        };

        self.db.mark_launched(scope_key, update.id).await?;
        self.db.mark_update_accessed(update.id).await?;
        let record = self.db.begin_launch(update.id).await?;

        metrics::LAUNCHES
            .with_label_values(&[update.status.as_str()])
            .inc();
        tracing::info!(
            update_id = %update.id,
            status = %update.status,
            launch_id = %record.id,
            "Launching update"
        );

        Ok(LaunchSelection {
            descriptor: LaunchDescriptor {
                launch_id: record.id,
                update_id: update.id,
                scope_key: scope_key.to_string(),
                status: update.status,
                asset_paths,
                asset_hashes,
                launch_asset,
                manifest_body: update.manifest_body.clone(),
            },
            skipped,
        })
    }

    async fn resolve_assets(&self, update: &Update) -> LaunchResult<Resolved> {
        let mut asset_paths = BTreeMap::new();
        let mut asset_hashes = BTreeMap::new();
        let mut launch_asset = None;
        let mut missing = Vec::new();

        for asset in self.db.assets_for_update(update.id).await? {
            match self.store.locate(&asset.hash).await {
                Ok(path) => {
                    if asset.is_launch_asset {
                        launch_asset = Some(path.clone());
                    }
                    asset_hashes.insert(asset.key.clone(), asset.hash);
                    asset_paths.insert(asset.key, path);
                }
                Err(e) if e.is_not_found() => {
                    if !missing.contains(&asset.hash) {
                        missing.push(asset.hash);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        if missing.is_empty() {
            Ok(Resolved::Complete {
                asset_paths,
                asset_hashes,
                launch_asset,
            })
        } else {
            Ok(Resolved::Missing(missing))
        }
    }
}
