//! Garbage collection of old updates and unreferenced blobs.

use crate::error::EngineResult;
use crate::metrics;
use crate::selection::ReaperSelectionPolicy;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::instrument;
use updraft_core::{SelectionFilters, UpdateId};
use updraft_metadata::UpdateDatabase;
use updraft_storage::AssetStore;

/// What a reap pass removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub updates_deleted: usize,
    pub blobs_deleted: usize,
}

pub struct Reaper {
    db: Arc<dyn UpdateDatabase>,
    store: Arc<dyn AssetStore>,
    policy: Arc<dyn ReaperSelectionPolicy>,
    commit_gate: Arc<RwLock<()>>,
}

impl Reaper {
    pub fn new(
        db: Arc<dyn UpdateDatabase>,
        store: Arc<dyn AssetStore>,
        policy: Arc<dyn ReaperSelectionPolicy>,
        commit_gate: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            db,
            store,
            policy,
            commit_gate,
        }
    }

    /// Delete the updates the policy gives up, then every blob no remaining
    /// update references.
    ///
    /// `ProtectedUpdate` from the database is returned as-is; nothing is
    /// deleted in that case. The live set is computed and the store swept
    /// while holding the commit gate exclusively, so no blob committed by a
    /// concurrent load can be swept.
    #[instrument(skip(self, filters))]
    pub async fn reap(
        &self,
        scope_key: &str,
        launched: Option<UpdateId>,
        filters: &SelectionFilters,
    ) -> EngineResult<ReapReport> {
        let updates = self.db.updates_for_scope(scope_key).await?;
        let launched = launched.and_then(|id| updates.iter().find(|u| u.id == id));
        let doomed = self.policy.updates_to_delete(launched, &updates, filters);

        let updates_deleted = if doomed.is_empty() {
            0
        } else {
            self.db.delete_updates(&doomed).await?
        };

        let blobs_deleted = {
            let _gate = self.commit_gate.write().await;
            let live = self.db.live_asset_hashes().await?;
            self.store.reap(&live).await?
        };

        metrics::REAPED_UPDATES.inc_by(updates_deleted as u64);
        metrics::REAPED_BLOBS.inc_by(blobs_deleted as u64);
        if updates_deleted > 0 || blobs_deleted > 0 {
            tracing::info!(updates_deleted, blobs_deleted, "Reap complete");
        } else {
            tracing::debug!("Reap found nothing to delete");
        }

        Ok(ReapReport {
            updates_deleted,
            blobs_deleted,
        })
    }
}
