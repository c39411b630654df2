//! Selection policies: which update to launch, fetch and delete.
//!
//! All three are pure functions over update rows so hosts can replace any
//! of them independently. The defaults share one eligibility predicate.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use updraft_core::{Manifest, RuntimeCompatibility, SelectionFilters, Update, UpdateId};

/// Picks the update to launch.
pub trait LauncherSelectionPolicy: Send + Sync + 'static {
    /// Best launchable candidate, or `None` when nothing qualifies.
    fn select_launchable(
        &self,
        candidates: &[Update],
        runtime_version: &str,
        filters: &SelectionFilters,
    ) -> Option<UpdateId>;
}

/// Decides whether a remote manifest is worth downloading.
pub trait LoaderSelectionPolicy: Send + Sync + 'static {
    fn should_fetch(
        &self,
        remote: &Manifest,
        scope_key: &str,
        current_launchable: Option<&Update>,
        runtime_version: &str,
        filters: &SelectionFilters,
    ) -> bool;
}

/// Picks updates the reaper may delete.
pub trait ReaperSelectionPolicy: Send + Sync + 'static {
    fn updates_to_delete(
        &self,
        launched: Option<&Update>,
        all: &[Update],
        filters: &SelectionFilters,
    ) -> HashSet<UpdateId>;
}

/// Deterministic rollout bucket in `0..100`.
///
/// The first eight bytes of `SHA-256(scope_key ‖ 0 ‖ update_id [‖ 0 ‖ installation_id])`
/// read as a big-endian integer, modulo 100. Without an installation id every
/// device shares the bucket for an update, so a rollout is all-or-nothing per
/// update; with one, devices spread across buckets.
pub fn rollout_bucket(scope_key: &str, update_id: UpdateId, installation_id: Option<&str>) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(scope_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(update_id.as_uuid().as_bytes());
    if let Some(installation_id) = installation_id {
        hasher.update([0u8]);
        hasher.update(installation_id.as_bytes());
    }
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

/// Whether an update falls inside a rollout percentage.
pub fn in_rollout(
    scope_key: &str,
    update_id: UpdateId,
    percentage: Option<u8>,
    installation_id: Option<&str>,
) -> bool {
    match percentage {
        None => true,
        Some(p) if p >= 100 => true,
        Some(p) => rollout_bucket(scope_key, update_id, installation_id) < p,
    }
}

/// Default policies.
///
/// Embedded updates always qualify for launch: they are the fallback of last
/// resort and bypass runtime, filter, rollout and crash-loop checks.
#[derive(Clone, Debug)]
pub struct DefaultSelectionPolicy {
    compatibility: RuntimeCompatibility,
    failure_threshold: u32,
}

impl DefaultSelectionPolicy {
    pub fn new(compatibility: RuntimeCompatibility, failure_threshold: u32) -> Self {
        Self {
            compatibility,
            failure_threshold,
        }
    }

    fn is_launch_eligible(
        &self,
        update: &Update,
        runtime_version: &str,
        filters: &SelectionFilters,
    ) -> bool {
        if !update.status.is_launchable() {
            return false;
        }
        if update.is_embedded() {
            return true;
        }
        if update.consecutive_failure_count >= self.failure_threshold {
            return false;
        }
        self.compatibility
            .is_compatible(runtime_version, &update.runtime_version)
            && filters.manifest_filters.matches(&update.metadata())
            && in_rollout(
                &update.scope_key,
                update.id,
                update.rollout_percentage().or(filters.rollout_percentage),
                filters.installation_id.as_deref(),
            )
    }
}

impl Default for DefaultSelectionPolicy {
    fn default() -> Self {
        Self::new(RuntimeCompatibility::Exact, 2)
    }
}

impl LauncherSelectionPolicy for DefaultSelectionPolicy {
    fn select_launchable(
        &self,
        candidates: &[Update],
        runtime_version: &str,
        filters: &SelectionFilters,
    ) -> Option<UpdateId> {
        candidates
            .iter()
            .filter(|u| self.is_launch_eligible(u, runtime_version, filters))
            .max_by(|a, b| {
                a.commit_time
                    .cmp(&b.commit_time)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|u| u.id)
    }
}

impl LoaderSelectionPolicy for DefaultSelectionPolicy {
    fn should_fetch(
        &self,
        remote: &Manifest,
        scope_key: &str,
        current_launchable: Option<&Update>,
        runtime_version: &str,
        filters: &SelectionFilters,
    ) -> bool {
        if !self
            .compatibility
            .is_compatible(runtime_version, &remote.runtime_version)
        {
            return false;
        }
        if !filters.manifest_filters.matches(&remote.metadata) {
            return false;
        }
        if !in_rollout(
            scope_key,
            remote.id,
            remote.rollout_percentage().or(filters.rollout_percentage),
            filters.installation_id.as_deref(),
        ) {
            return false;
        }

        match current_launchable {
            None => true,
            Some(current) if current.id == remote.id => false,
            // A running update the server's filters now exclude is replaced
            // by whatever the server offers.
            Some(current) if !filters.manifest_filters.matches(&current.metadata()) => true,
            Some(current) => remote.commit_time > current.commit_time,
        }
    }
}

impl ReaperSelectionPolicy for DefaultSelectionPolicy {
    /// Keeps the launched update, embedded and kept updates, everything newer
    /// than the launched update, and the newest older `Ready` update as a
    /// fallback (preferring one that matches the filters). Deletes nothing if
    /// no update has been launched.
    fn updates_to_delete(
        &self,
        launched: Option<&Update>,
        all: &[Update],
        filters: &SelectionFilters,
    ) -> HashSet<UpdateId> {
        let Some(launched) = launched else {
            return HashSet::new();
        };

        let older: Vec<&Update> = all
            .iter()
            .filter(|u| u.id != launched.id && !u.is_embedded() && !u.keep && !u.launched)
            .filter(|u| u.commit_time <= launched.commit_time)
            .collect();

        let newest_ready = |matching: bool| {
            older
                .iter()
                .filter(|u| u.status == updraft_core::UpdateStatus::Ready)
                .filter(|u| !matching || filters.manifest_filters.matches(&u.metadata()))
                .max_by(|a, b| {
                    a.commit_time
                        .cmp(&b.commit_time)
                        .then_with(|| a.id.cmp(&b.id))
                })
                .map(|u| u.id)
        };
        let fallback = newest_ready(true).or_else(|| newest_ready(false));

        older
            .iter()
            .map(|u| u.id)
            .filter(|id| Some(*id) != fallback)
            .collect()
    }
}
