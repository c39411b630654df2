//! The update engine facade.
//!
//! [`UpdateEngine`] owns one database, one asset store and the components that
//! share them. It is cheap to clone; background checks run on clones.

use crate::embedded::ensure_embedded_update;
use crate::error::{EngineError, EngineResult, LaunchError, LoadError};
use crate::fetch::{HttpFetcher, ReqwestFetcher};
use crate::host::{HostCallbacks, NoopCallbacks};
use crate::launcher::{LaunchDescriptor, Launcher};
use crate::loader::{Loader, LoaderState, UpdateSource};
use crate::metrics;
use crate::reaper::{ReapReport, Reaper};
use crate::recovery::{
    DiagnosticEntry, DiagnosticLog, ErrorRecoveryCoordinator, RecoveryDecision, RecoveryState,
};
use crate::selection::{
    DefaultSelectionPolicy, LauncherSelectionPolicy, LoaderSelectionPolicy, ReaperSelectionPolicy,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use updraft_core::config::{EngineConfig, NetworkType};
use updraft_core::{
    LaunchOutcome, ManifestFilters, SelectionFilters, Update, UpdateId, UpdateStatus,
};
use updraft_metadata::{EXTRA_PARAMS_KEY, MANIFEST_FILTERS_KEY, UpdateDatabase};
use updraft_signer::{Ed25519Verifier, SignatureVerifier};
use updraft_storage::AssetStore;

/// Configures and opens an [`UpdateEngine`].
///
/// Every collaborator defaults to the one the configuration describes.
pub struct EngineBuilder {
    config: EngineConfig,
    db: Option<Arc<dyn UpdateDatabase>>,
    store: Option<Arc<dyn AssetStore>>,
    fetcher: Option<Arc<dyn HttpFetcher>>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    callbacks: Arc<dyn HostCallbacks>,
    launcher_policy: Option<Arc<dyn LauncherSelectionPolicy>>,
    loader_policy: Option<Arc<dyn LoaderSelectionPolicy>>,
    reaper_policy: Option<Arc<dyn ReaperSelectionPolicy>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            db: None,
            store: None,
            fetcher: None,
            verifier: None,
            callbacks: Arc::new(NoopCallbacks),
            launcher_policy: None,
            loader_policy: None,
            reaper_policy: None,
        }
    }

    pub fn database(mut self, db: Arc<dyn UpdateDatabase>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn HttpFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Overrides the verifier built from `signing.public_keys`.
    pub fn verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn callbacks(mut self, callbacks: Arc<dyn HostCallbacks>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn launcher_policy(mut self, policy: Arc<dyn LauncherSelectionPolicy>) -> Self {
        self.launcher_policy = Some(policy);
        self
    }

    pub fn loader_policy(mut self, policy: Arc<dyn LoaderSelectionPolicy>) -> Self {
        self.loader_policy = Some(policy);
        self
    }

    pub fn reaper_policy(mut self, policy: Arc<dyn ReaperSelectionPolicy>) -> Self {
        self.reaper_policy = Some(policy);
        self
    }

    /// Validate the configuration, open storage and install the embedded update.
    pub async fn open(self) -> EngineResult<UpdateEngine> {
        let config = self.config;
        config.validate().map_err(EngineError::Config)?;
        metrics::register_metrics();

        let scope_key = config.effective_scope_key();
        let store = match self.store {
            Some(store) => store,
            None => updraft_storage::from_config(&config.storage).await?,
        };
        let db = match self.db {
            Some(db) => db,
            None => updraft_metadata::from_config(&config.metadata).await?,
        };
        let fetcher: Arc<dyn HttpFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(ReqwestFetcher::new()?),
        };
        let verifier: Option<Arc<dyn SignatureVerifier>> = match (self.verifier, &config.signing) {
            (Some(verifier), _) => Some(verifier),
            (None, Some(signing)) => Some(Arc::new(Ed25519Verifier::from_key_strings(
                signing.public_keys.as_slice(),
            )?)),
            (None, None) => None,
        };
        let signature_required = config.signing.as_ref().is_some_and(|s| s.required);

        let default_policy = Arc::new(DefaultSelectionPolicy::new(
            config.runtime_compatibility,
            config.recovery.failure_threshold,
        ));
        let commit_gate = Arc::new(RwLock::new(()));

        let mut loader = Loader::new(
            db.clone(),
            store.clone(),
            fetcher,
            self.loader_policy
                .unwrap_or_else(|| default_policy.clone() as Arc<dyn LoaderSelectionPolicy>),
            config.loader.clone(),
            commit_gate.clone(),
        );
        if let Some(verifier) = verifier {
            loader = loader.with_verifier(verifier, signature_required);
        }
        let launcher = Launcher::new(
            db.clone(),
            store.clone(),
            self.launcher_policy
                .unwrap_or_else(|| default_policy.clone() as Arc<dyn LauncherSelectionPolicy>),
        );
        let reaper = Reaper::new(
            db.clone(),
            store.clone(),
            self.reaper_policy
                .unwrap_or_else(|| default_policy as Arc<dyn ReaperSelectionPolicy>),
            commit_gate.clone(),
        );
        let recovery = ErrorRecoveryCoordinator::new(
            db.clone(),
            self.callbacks.clone(),
            scope_key.clone(),
            config.recovery.failure_threshold,
        );

        let embedded_update_id = match &config.embedded {
            Some(embedded) => Some(
                ensure_embedded_update(
                    db.as_ref(),
                    store.as_ref(),
                    &commit_gate,
                    &scope_key,
                    embedded,
                )
                .await?,
            ),
            None => None,
        };

        tracing::info!(
            scope_key = %scope_key,
            runtime_version = %config.runtime_version,
            storage = store.backend_name(),
            embedded = ?embedded_update_id,
            "Update engine opened"
        );

        Ok(UpdateEngine {
            inner: Arc::new(Inner {
                config,
                scope_key,
                db,
                store,
                loader,
                launcher,
                reaper,
                recovery,
                callbacks: self.callbacks,
                commit_gate,
                embedded_update_id,
                current: Mutex::new(None),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }
}

struct Inner {
    config: EngineConfig,
    scope_key: String,
    db: Arc<dyn UpdateDatabase>,
    store: Arc<dyn AssetStore>,
    loader: Loader,
    launcher: Launcher,
    reaper: Reaper,
    recovery: ErrorRecoveryCoordinator,
    callbacks: Arc<dyn HostCallbacks>,
    commit_gate: Arc<RwLock<()>>,
    embedded_update_id: Option<UpdateId>,
    current: Mutex<Option<LaunchDescriptor>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Update summary for status output.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateSummary {
    pub id: UpdateId,
    pub status: UpdateStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    pub keep: bool,
    pub launched: bool,
    pub successful_launch_count: u32,
    pub failed_launch_count: u32,
    pub consecutive_failure_count: u32,
}

impl From<&Update> for UpdateSummary {
    fn from(update: &Update) -> Self {
        Self {
            id: update.id,
            status: update.status,
            commit_time: update.commit_time,
            runtime_version: update.runtime_version.clone(),
            keep: update.keep,
            launched: update.launched,
            successful_launch_count: update.successful_launch_count,
            failed_launch_count: update.failed_launch_count,
            consecutive_failure_count: update.consecutive_failure_count,
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Clone, Debug, Serialize)]
pub struct EngineStatus {
    pub scope_key: String,
    pub runtime_version: String,
    pub loader_state: LoaderState,
    pub recovery_state: RecoveryState,
    pub embedded_update_id: Option<UpdateId>,
    /// What `launch` would pick right now.
    pub launchable_update_id: Option<UpdateId>,
    /// The update launched by this engine, if any.
    pub current_update_id: Option<UpdateId>,
    pub updates: Vec<UpdateSummary>,
}

#[derive(Clone)]
pub struct UpdateEngine {
    inner: Arc<Inner>,
}

impl UpdateEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Open with every collaborator built from `config`.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        EngineBuilder::new(config).open().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn scope_key(&self) -> &str {
        &self.inner.scope_key
    }

    pub fn embedded_update_id(&self) -> Option<UpdateId> {
        self.inner.embedded_update_id
    }

    pub fn database(&self) -> &Arc<dyn UpdateDatabase> {
        &self.inner.db
    }

    pub fn store(&self) -> &Arc<dyn AssetStore> {
        &self.inner.store
    }

    pub fn loader_state(&self) -> LoaderState {
        self.inner.loader.state()
    }

    pub fn subscribe_loader_state(&self) -> watch::Receiver<LoaderState> {
        self.inner.loader.subscribe()
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.inner.recovery.state()
    }

    /// The descriptor of the most recent launch in this process.
    pub fn current_launch(&self) -> Option<LaunchDescriptor> {
        self.lock_current().clone()
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<LaunchDescriptor>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Startup flow.
    ///
    /// Finalizes launches a previous process never reported, then checks the
    /// remote source if `check_automatically` allows `network`. With a launch
    /// wait configured the check gets that long to make a newer update ready
    /// before the launch; otherwise it continues in the background.
    pub async fn start(&self, network: NetworkType) -> EngineResult<LaunchDescriptor> {
        let inner = &self.inner;
        let recoveries = inner.recovery.finish_interrupted_launches().await?;
        if !recoveries.is_empty() {
            tracing::warn!(
                recoveries = recoveries.len(),
                "Recovering from crash loop detected at startup"
            );
        }

        let check_allowed = inner.config.update_url.is_some()
            && inner.config.check_automatically.allows(network);
        if check_allowed {
            let check = self.spawn_check("startup");
            let wait = inner.config.launch_wait_timeout();
            if !wait.is_zero() {
                match tokio::time::timeout(wait, check).await {
                    Ok(_) => tracing::debug!("Startup check finished before launch"),
                    Err(_) => tracing::info!(
                        wait_ms = inner.config.launch_wait_timeout_ms,
                        "Launch wait elapsed, launching local update"
                    ),
                }
            }
        } else {
            tracing::debug!(network = ?network, "Skipping automatic update check");
        }

        self.launch().await
    }

    /// Launch the best local update.
    ///
    /// Updates with vanished blobs are skipped, reported as diagnostics and
    /// queued for a background re-fetch. If nothing remains, the embedded
    /// bundle is restored and the launch retried once.
    pub async fn launch(&self) -> EngineResult<LaunchDescriptor> {
        let inner = &self.inner;
        let filters = self.effective_filters().await?;
        let excluded = inner.recovery.excluded();

        let attempt = inner
            .launcher
            .launch(
                &inner.scope_key,
                &inner.config.runtime_version,
                &filters,
                &excluded,
            )
            .await;
        let selection = match attempt {
            Ok(selection) => selection,
            Err(LaunchError::NoLaunchableUpdate { .. }) if inner.config.embedded.is_some() => {
                tracing::warn!("No launchable update, restoring embedded bundle");
                self.restore_embedded().await?;
                inner
                    .launcher
                    .launch(
                        &inner.scope_key,
                        &inner.config.runtime_version,
                        &filters,
                        &excluded,
                    )
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        let mut refetch = false;
        for skipped in &selection.skipped {
            let update_id = match skipped {
                LaunchError::AssetMissing { update_id, .. } => Some(*update_id),
                _ => None,
            };
            inner
                .recovery
                .record_diagnostic(DiagnosticEntry::new(
                    skipped.code(),
                    update_id,
                    skipped.to_string(),
                ))
                .await?;
            refetch |= update_id != inner.embedded_update_id;
        }
        if refetch && inner.config.update_url.is_some() {
            self.spawn_check("asset_missing");
        }

        let descriptor = selection.descriptor;
        inner.recovery.begin_monitoring(descriptor.update_id);
        *self.lock_current() = Some(descriptor.clone());
        inner.callbacks.on_launch_descriptor_ready(&descriptor);
        Ok(descriptor)
    }

    async fn restore_embedded(&self) -> EngineResult<()> {
        let inner = &self.inner;
        if let Some(embedded) = &inner.config.embedded {
            ensure_embedded_update(
                inner.db.as_ref(),
                inner.store.as_ref(),
                &inner.commit_gate,
                &inner.scope_key,
                embedded,
            )
            .await?;
        }
        Ok(())
    }

    /// Check the remote source once and load what it offers.
    ///
    /// Returns the id of an update that became `Ready`. Failures are recorded
    /// as diagnostics before being returned.
    pub async fn check_for_update(&self) -> EngineResult<Option<UpdateId>> {
        let inner = &self.inner;
        let Some(url) = inner.config.update_url.clone() else {
            return Err(EngineError::Config(
                "update_url is not configured".to_string(),
            ));
        };

        let updates = inner.db.updates_for_scope(&inner.scope_key).await?;
        let filters = self.effective_filters().await?;
        let current_launchable = inner
            .launcher
            .select(
                &updates,
                &inner.config.runtime_version,
                &filters,
                &inner.recovery.excluded(),
            )
            .cloned();

        let source = UpdateSource {
            url,
            scope_key: inner.scope_key.clone(),
            runtime_version: inner.config.runtime_version.clone(),
            current_launchable,
            embedded_update_id: inner.embedded_update_id,
            filters: inner.config.rollout_filters.clone(),
            request_headers: inner.config.request_headers.clone(),
        };
        let cancel = inner.cancel.child_token();
        let callbacks = &inner.callbacks;

        match inner
            .loader
            .load_update(&source, |manifest| callbacks.accept_manifest(manifest), &cancel)
            .await
        {
            Ok(loaded) => Ok(loaded),
            Err(e) => {
                if !matches!(e, LoadError::Cancelled) {
                    inner
                        .recovery
                        .record_diagnostic(DiagnosticEntry::new(e.code(), None, e.to_string()))
                        .await?;
                }
                Err(e.into())
            }
        }
    }

    fn spawn_check(&self, reason: &'static str) -> JoinHandle<()> {
        let engine = self.clone();
        self.inner.tasks.spawn(async move {
            match engine.check_for_update().await {
                Ok(Some(update_id)) => {
                    tracing::info!(update_id = %update_id, reason, "Background check loaded update");
                }
                Ok(None) => tracing::debug!(reason, "Background check found nothing new"),
                Err(e) => {
                    tracing::warn!(error = %e, code = e.code(), reason, "Background check failed");
                }
            }
        })
    }

    /// Record the host's verdict on a launch.
    ///
    /// Returns a replacement descriptor when the failure put the update into
    /// recovery; the host should run it instead.
    pub async fn report_launch_outcome(
        &self,
        update_id: UpdateId,
        succeeded: bool,
    ) -> EngineResult<Option<LaunchDescriptor>> {
        let outcome = if succeeded {
            LaunchOutcome::Succeeded
        } else {
            LaunchOutcome::Crashed
        };
        self.finish_launch(update_id, outcome).await
    }

    /// The host gave up waiting for the launch to become healthy.
    pub async fn report_launch_timed_out(
        &self,
        update_id: UpdateId,
    ) -> EngineResult<Option<LaunchDescriptor>> {
        self.finish_launch(update_id, LaunchOutcome::TimedOut).await
    }

    async fn finish_launch(
        &self,
        update_id: UpdateId,
        outcome: LaunchOutcome,
    ) -> EngineResult<Option<LaunchDescriptor>> {
        let decision = self
            .inner
            .recovery
            .report_launch_outcome(update_id, outcome)
            .await?;

        match decision {
            RecoveryDecision::Continue => Ok(None),
            RecoveryDecision::Recover { failed_update_id } => {
                let inner = &self.inner;
                if inner.config.recovery.fetch_on_recovery && inner.config.update_url.is_some() {
                    self.spawn_check("recovery");
                }
                let descriptor = self.launch().await?;
                tracing::info!(
                    failed_update_id = %failed_update_id,
                    update_id = %descriptor.update_id,
                    "Relaunched after crash loop"
                );
                Ok(Some(descriptor))
            }
        }
    }

    /// Diagnostics recorded since the last call, at most once each.
    pub async fn consume_diagnostics(&self) -> EngineResult<Option<DiagnosticLog>> {
        self.inner.recovery.consume_diagnostics().await
    }

    /// Delete superseded updates and unreferenced blobs.
    ///
    /// The launched update is this process's current launch or, failing
    /// that, the update the scope last launched.
    pub async fn reap(&self) -> EngineResult<ReapReport> {
        let inner = &self.inner;
        let current = self.lock_current().as_ref().map(|d| d.update_id);
        let launched = match current {
            Some(id) => Some(id),
            None => inner
                .db
                .updates_for_scope(&inner.scope_key)
                .await?
                .into_iter()
                .find(|u| u.launched)
                .map(|u| u.id),
        };
        let filters = self.effective_filters().await?;
        inner
            .reaper
            .reap(&inner.scope_key, launched, &filters)
            .await
    }

    /// Values sent as the extra-params header on manifest requests.
    /// An empty map clears them.
    pub async fn set_extra_params(&self, params: &BTreeMap<String, String>) -> EngineResult<()> {
        let inner = &self.inner;
        if params.is_empty() {
            inner
                .db
                .delete_json_data(&inner.scope_key, EXTRA_PARAMS_KEY)
                .await?;
            return Ok(());
        }
        let value = serde_json::to_string(params)
            .map_err(|e| EngineError::Config(format!("invalid extra params: {e}")))?;
        inner
            .db
            .set_json_data(&inner.scope_key, EXTRA_PARAMS_KEY, &value)
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> EngineResult<EngineStatus> {
        let inner = &self.inner;
        let updates = inner.db.updates_for_scope(&inner.scope_key).await?;
        let filters = self.effective_filters().await?;
        let launchable_update_id = inner
            .launcher
            .select(
                &updates,
                &inner.config.runtime_version,
                &filters,
                &inner.recovery.excluded(),
            )
            .map(|u| u.id);

        Ok(EngineStatus {
            scope_key: inner.scope_key.clone(),
            runtime_version: inner.config.runtime_version.clone(),
            loader_state: inner.loader.state(),
            recovery_state: inner.recovery.state(),
            embedded_update_id: inner.embedded_update_id,
            launchable_update_id,
            current_update_id: self.lock_current().as_ref().map(|d| d.update_id),
            updates: updates.iter().map(UpdateSummary::from).collect(),
        })
    }

    /// Cancel in-flight loads and wait for background work to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::debug!("Update engine shut down");
    }

    /// Wait for background checks without cancelling them.
    pub async fn wait_for_background_tasks(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Configured filters overlaid with the server's last stored filters.
    async fn effective_filters(&self) -> EngineResult<SelectionFilters> {
        let inner = &self.inner;
        let stored = match inner
            .db
            .get_json_data(&inner.scope_key, MANIFEST_FILTERS_KEY)
            .await?
        {
            Some(raw) => ManifestFilters::from_json(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Ignoring stored manifest filters");
                ManifestFilters::new()
            }),
            None => ManifestFilters::new(),
        };
        Ok(inner.config.rollout_filters.with_server_filters(&stored))
    }
}
