//! Crash-loop detection and recovery.
//!
//! The coordinator counts host-reported launch outcomes. When an update
//! reaches the failure threshold with no success in between, it is excluded
//! from launch selection for the rest of the process and the coordinator
//! enters `Recovering`; the engine then relaunches onto the next candidate,
//! ultimately the embedded update. The persisted consecutive-failure count
//! keeps the update excluded across restarts.
//!
//! Diagnostics are appended to the scope's key-value table and handed out by
//! [`ErrorRecoveryCoordinator::consume_diagnostics`] at most once.

use crate::error::EngineResult;
use crate::host::HostCallbacks;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use updraft_core::{LaunchOutcome, Update, UpdateId};
use updraft_metadata::{DIAGNOSTICS_KEY, UpdateDatabase};

/// Diagnostics kept between consumptions; older entries are dropped.
const MAX_DIAGNOSTICS: usize = 100;

/// Failed update ids attached to a consumed diagnostic log.
const RECENT_FAILED_LIMIT: usize = 5;

/// Launch records scanned for an in-progress launch.
const LAUNCH_LOOKBACK: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RecoveryState {
    Idle,
    /// A launch is running and its outcome has not been reported.
    Monitoring { update_id: UpdateId },
    /// `failed_update_id` crossed the failure threshold.
    Recovering { failed_update_id: UpdateId },
}

/// What the engine should do after an outcome is recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryDecision {
    Continue,
    /// Relaunch without `failed_update_id`.
    Recover { failed_update_id: UpdateId },
}

/// One recorded problem.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub code: String,
    #[serde(default)]
    pub update_id: Option<UpdateId>,
    pub message: String,
}

impl DiagnosticEntry {
    pub fn new(code: impl Into<String>, update_id: Option<UpdateId>, message: impl Into<String>) -> Self {
        Self {
            at: OffsetDateTime::now_utc(),
            code: code.into(),
            update_id,
            message: message.into(),
        }
    }
}

/// Diagnostics accumulated since the last consumption.
#[derive(Clone, Debug, Serialize)]
pub struct DiagnosticLog {
    pub entries: Vec<DiagnosticEntry>,
    /// Updates in the scope with at least one failed launch, newest first.
    pub recent_failed_update_ids: Vec<UpdateId>,
}

struct Inner {
    state: RecoveryState,
    excluded: HashSet<UpdateId>,
}

pub struct ErrorRecoveryCoordinator {
    db: Arc<dyn UpdateDatabase>,
    callbacks: Arc<dyn HostCallbacks>,
    scope_key: String,
    failure_threshold: u32,
    inner: Mutex<Inner>,
}

impl ErrorRecoveryCoordinator {
    pub fn new(
        db: Arc<dyn UpdateDatabase>,
        callbacks: Arc<dyn HostCallbacks>,
        scope_key: impl Into<String>,
        failure_threshold: u32,
    ) -> Self {
        Self {
            db,
            callbacks,
            scope_key: scope_key.into(),
            failure_threshold: failure_threshold.max(1),
            inner: Mutex::new(Inner {
                state: RecoveryState::Idle,
                excluded: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State stays consistent across a panicking holder: every write is a
        // single assignment or set insert.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> RecoveryState {
        self.lock().state
    }

    /// Updates excluded from launch selection in this process.
    pub fn excluded(&self) -> HashSet<UpdateId> {
        self.lock().excluded.clone()
    }

    /// A launch of `update_id` has begun.
    pub fn begin_monitoring(&self, update_id: UpdateId) {
        self.lock().state = RecoveryState::Monitoring { update_id };
    }

    /// Record a host-reported outcome for the latest launch of `update_id`.
    ///
    /// Finishes the update's in-progress launch record, or counts the outcome
    /// directly when there is none.
    pub async fn report_launch_outcome(
        &self,
        update_id: UpdateId,
        outcome: LaunchOutcome,
    ) -> EngineResult<RecoveryDecision> {
        let in_progress = self
            .db
            .launches_for_update(update_id, LAUNCH_LOOKBACK)
            .await?
            .into_iter()
            .find(|launch| launch.outcome == LaunchOutcome::InProgress);

        let update = match in_progress {
            Some(launch) => self.db.finish_launch(launch.id, outcome).await?.1,
            None => {
                self.db
                    .increment_launch_outcome(update_id, !outcome.is_failure())
                    .await?
            }
        };

        self.observe(&update, outcome).await
    }

    /// Finalize launches a previous process left `InProgress` as crashed.
    ///
    /// Returns the recoveries this triggers.
    pub async fn finish_interrupted_launches(&self) -> EngineResult<Vec<RecoveryDecision>> {
        let mut decisions = Vec::new();
        for launch in self.db.interrupted_launches().await? {
            let (_, update) = self
                .db
                .finish_launch(launch.id, LaunchOutcome::Crashed)
                .await?;
            tracing::warn!(
                update_id = %update.id,
                launch_id = %launch.id,
                "Previous launch never reported an outcome, counting it as a crash"
            );
            self.record_diagnostic(DiagnosticEntry::new(
                "interrupted_launch",
                Some(update.id),
                format!("launch {} was interrupted", launch.id),
            ))
            .await?;

            let decision = self.observe(&update, LaunchOutcome::Crashed).await?;
            if decision != RecoveryDecision::Continue {
                decisions.push(decision);
            }
        }
        Ok(decisions)
    }

    async fn observe(
        &self,
        update: &Update,
        outcome: LaunchOutcome,
    ) -> EngineResult<RecoveryDecision> {
        if !outcome.is_failure() {
            self.lock().state = RecoveryState::Idle;
            tracing::debug!(update_id = %update.id, "Launch succeeded");
            return Ok(RecoveryDecision::Continue);
        }

        self.record_diagnostic(DiagnosticEntry::new(
            "launch_failed",
            Some(update.id),
            format!(
                "launch {}, {} consecutive failure(s)",
                outcome.as_str(),
                update.consecutive_failure_count
            ),
        ))
        .await?;

        if update.is_embedded() || update.consecutive_failure_count < self.failure_threshold {
            self.lock().state = RecoveryState::Idle;
            return Ok(RecoveryDecision::Continue);
        }

        let newly_excluded = {
            let mut inner = self.lock();
            inner.state = RecoveryState::Recovering {
                failed_update_id: update.id,
            };
            inner.excluded.insert(update.id)
        };
        if !newly_excluded {
            return Ok(RecoveryDecision::Continue);
        }

        metrics::RECOVERIES.inc();
        tracing::warn!(
            update_id = %update.id,
            failures = update.consecutive_failure_count,
            "Crash loop detected, falling back"
        );
        self.record_diagnostic(DiagnosticEntry::new(
            "crash_loop",
            Some(update.id),
            format!(
                "{} consecutive failed launches, excluding update",
                update.consecutive_failure_count
            ),
        ))
        .await?;

        Ok(RecoveryDecision::Recover {
            failed_update_id: update.id,
        })
    }

    /// Persist a diagnostic and forward it to the host.
    pub async fn record_diagnostic(&self, entry: DiagnosticEntry) -> EngineResult<()> {
        match serde_json::to_string(&entry) {
            Ok(json) => {
                self.db
                    .append_json_list(&self.scope_key, DIAGNOSTICS_KEY, &json, MAX_DIAGNOSTICS)
                    .await?;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize diagnostic"),
        }
        self.callbacks.on_diagnostic(&entry);
        Ok(())
    }

    /// Take every diagnostic recorded since the last call.
    ///
    /// `None` when there is nothing new. An entry is returned at most once,
    /// even across processes sharing the database.
    pub async fn consume_diagnostics(&self) -> EngineResult<Option<DiagnosticLog>> {
        let Some(raw) = self
            .db
            .take_json_data(&self.scope_key, DIAGNOSTICS_KEY)
            .await?
        else {
            return Ok(None);
        };

        let entries: Vec<DiagnosticEntry> = serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Discarding unreadable diagnostics");
            Vec::new()
        });
        if entries.is_empty() {
            return Ok(None);
        }

        let recent_failed_update_ids = self
            .db
            .recent_update_ids_with_failed_launch(&self.scope_key, RECENT_FAILED_LIMIT)
            .await?;
        Ok(Some(DiagnosticLog {
            entries,
            recent_failed_update_ids,
        }))
    }
}
