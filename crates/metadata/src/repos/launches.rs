//! Launch record repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use updraft_core::{LaunchOutcome, LaunchRecord, Update, UpdateId};
use uuid::Uuid;

/// Repository for launch attempts.
#[async_trait]
pub trait LaunchRepo: Send + Sync {
    /// Record the start of a launch. The record stays `InProgress` until finished.
    async fn begin_launch(&self, update_id: UpdateId) -> MetadataResult<LaunchRecord>;

    /// Finish an in-progress launch and count its outcome on the update in
    /// one transaction.
    ///
    /// Fails with `InvalidStateTransition` if the record is already finished.
    async fn finish_launch(
        &self,
        launch_id: Uuid,
        outcome: LaunchOutcome,
    ) -> MetadataResult<(LaunchRecord, Update)>;

    /// Launches still `InProgress`, oldest first.
    async fn interrupted_launches(&self) -> MetadataResult<Vec<LaunchRecord>>;

    /// Most recent launches of an update, newest first.
    async fn launches_for_update(
        &self,
        update_id: UpdateId,
        limit: usize,
    ) -> MetadataResult<Vec<LaunchRecord>>;
}
