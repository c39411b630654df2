//! Remote update loader.
//!
//! One load walks `Idle → FetchingManifest → FetchingAssets → Verifying →
//! Committing → Idle`. Assets move through the pipeline independently: each
//! is downloaded, verified, written to the asset store and marked verified
//! under the commit gate as soon as it arrives, so the published state is
//! the furthest phase any asset has reached. A failed asset fails the load
//! and leaves the update `Pending` once the others have settled; a later
//! load of the same manifest fetches only what is still missing.

use crate::error::{LoadError, LoadResult};
use crate::fetch::{FetchResponse, HttpFetcher, ProgressFn};
use crate::metrics;
use crate::retry::{with_retry, with_timeout};
use crate::selection::LoaderSelectionPolicy;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use updraft_core::config::LoaderConfig;
use updraft_core::{
    Asset, AssetStatus, ContentHash, Manifest, ManifestFilters, SelectionFilters, Update,
    UpdateId, UpdateStatus,
};
use updraft_metadata::{
    EXTRA_PARAMS_KEY, MANIFEST_FILTERS_KEY, SERVER_DEFINED_HEADERS_KEY, UpdateDatabase,
};
use updraft_signer::{SignatureHeader, SignatureVerifier};
use updraft_storage::{AssetStore, StorageError};
use url::Url;

/// Header names of the manifest protocol.
pub mod headers {
    /// Detached signature over the raw manifest body.
    pub const SIGNATURE: &str = "updraft-signature";
    /// JSON object of filters the server applies to its manifests.
    pub const MANIFEST_FILTERS: &str = "updraft-manifest-filters";
    /// JSON object of headers to echo on later manifest requests.
    pub const SERVER_DEFINED_HEADERS: &str = "updraft-server-defined-headers";
    pub const RUNTIME_VERSION: &str = "updraft-runtime-version";
    pub const CURRENT_UPDATE_ID: &str = "updraft-current-update-id";
    pub const EMBEDDED_UPDATE_ID: &str = "updraft-embedded-update-id";
    pub const EXTRA_PARAMS: &str = "updraft-extra-params";
}

/// Loader progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderState {
    Idle,
    FetchingManifest,
    FetchingAssets,
    Verifying,
    Committing,
}

/// Where to look for an update and what the device currently runs.
#[derive(Clone, Debug)]
pub struct UpdateSource {
    pub url: String,
    pub scope_key: String,
    pub runtime_version: String,
    /// What the launcher would pick right now.
    pub current_launchable: Option<Update>,
    pub embedded_update_id: Option<UpdateId>,
    /// Configured filters. Stored server filters are overlaid by the loader.
    pub filters: SelectionFilters,
    /// Extra headers for the manifest request.
    pub request_headers: BTreeMap<String, String>,
}

/// Resets the published state to `Idle` when a load ends, however it ends.
struct StateGuard<'a> {
    state: &'a watch::Sender<LoaderState>,
}

impl<'a> StateGuard<'a> {
    fn new(state: &'a watch::Sender<LoaderState>) -> Self {
        Self { state }
    }

    fn set(&self, next: LoaderState) {
        self.state.send_replace(next);
    }

    /// Move forward to `next`; never moves back.
    fn advance(&self, next: LoaderState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.state.send_replace(LoaderState::Idle);
    }
}

struct FetchedAsset {
    asset: Asset,
    data: Bytes,
}

/// Fetches, verifies and commits remote updates.
pub struct Loader {
    db: Arc<dyn UpdateDatabase>,
    store: Arc<dyn AssetStore>,
    fetcher: Arc<dyn HttpFetcher>,
    policy: Arc<dyn LoaderSelectionPolicy>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    signature_required: bool,
    config: LoaderConfig,
    commit_gate: Arc<RwLock<()>>,
    state: watch::Sender<LoaderState>,
    single_flight: tokio::sync::Mutex<()>,
}

impl Loader {
    pub fn new(
        db: Arc<dyn UpdateDatabase>,
        store: Arc<dyn AssetStore>,
        fetcher: Arc<dyn HttpFetcher>,
        policy: Arc<dyn LoaderSelectionPolicy>,
        config: LoaderConfig,
        commit_gate: Arc<RwLock<()>>,
    ) -> Self {
        let (state, _) = watch::channel(LoaderState::Idle);
        Self {
            db,
            store,
            fetcher,
            policy,
            verifier: None,
            signature_required: false,
            config,
            commit_gate,
            state,
            single_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Check manifest signatures. With `required`, unsigned manifests are rejected.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>, required: bool) -> Self {
        self.verifier = Some(verifier);
        self.signature_required = required;
        self
    }

    pub fn state(&self) -> LoaderState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<LoaderState> {
        self.state.subscribe()
    }

    /// Load the update `source` currently offers.
    ///
    /// Returns `Ok(None)` when the server has nothing new, the selection
    /// policy or `on_manifest` declines the manifest, or the update is already
    /// stored. Returns the id once the update is `Ready`. Loads are serialized.
    #[instrument(skip_all, fields(scope_key = %source.scope_key))]
    pub async fn load_update<F>(
        &self,
        source: &UpdateSource,
        on_manifest: F,
        cancel: &CancellationToken,
    ) -> LoadResult<Option<UpdateId>>
    where
        F: FnOnce(&Manifest) -> bool + Send,
    {
        let _flight = self.single_flight.lock().await;
        let guard = StateGuard::new(&self.state);
        let started = Instant::now();

        let result = self.run(&guard, source, on_manifest, cancel).await;

        metrics::LOAD_DURATION.observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            metrics::record_load_failure(e.code());
            tracing::warn!(error = %e, code = e.code(), "Update load failed");
        }
        result
    }

    async fn run<F>(
        &self,
        guard: &StateGuard<'_>,
        source: &UpdateSource,
        on_manifest: F,
        cancel: &CancellationToken,
    ) -> LoadResult<Option<UpdateId>>
    where
        F: FnOnce(&Manifest) -> bool + Send,
    {
        guard.set(LoaderState::FetchingManifest);
        let response = match self.fetch_manifest(source, cancel).await {
            Ok(response) => response,
            Err(e) => {
                metrics::MANIFEST_REQUESTS.with_label_values(&["error"]).inc();
                return Err(e);
            }
        };

        if response.status == 204 {
            metrics::MANIFEST_REQUESTS
                .with_label_values(&["no_update"])
                .inc();
            tracing::debug!("Server reports no update");
            return Ok(None);
        }
        metrics::MANIFEST_REQUESTS.with_label_values(&["update"]).inc();

        self.check_signature(&response)?;
        let body = std::str::from_utf8(&response.body)
            .map_err(|e| LoadError::ManifestInvalid(format!("manifest is not UTF-8: {e}")))?;
        let manifest = Manifest::from_json(response.body.as_ref())
            .and_then(|m| m.validate_remote().map(|()| m))
            .map_err(|e| LoadError::ManifestInvalid(e.to_string()))?;

        let mut json_data = BTreeMap::new();
        let server_filters = match response.header(headers::MANIFEST_FILTERS) {
            Some(raw) => {
                let filters = ManifestFilters::from_json(raw).map_err(|e| {
                    LoadError::ManifestInvalid(format!("invalid manifest filters header: {e}"))
                })?;
                let normalized = filters
                    .to_json()
                    .map_err(|e| LoadError::ManifestInvalid(e.to_string()))?;
                json_data.insert(MANIFEST_FILTERS_KEY.to_string(), normalized);
                filters
            }
            None => self.stored_filters(&source.scope_key).await?,
        };
        if let Some(raw) = response.header(headers::SERVER_DEFINED_HEADERS) {
            match parse_header_object(raw) {
                Ok(map) => {
                    let normalized = serde_json::to_string(&map)
                        .map_err(|e| LoadError::ManifestInvalid(e.to_string()))?;
                    json_data.insert(SERVER_DEFINED_HEADERS_KEY.to_string(), normalized);
                }
                Err(e) => tracing::warn!(error = %e, "Ignoring malformed server-defined headers"),
            }
        }

        let filters = source.filters.with_server_filters(&server_filters);
        if !self.policy.should_fetch(
            &manifest,
            &source.scope_key,
            source.current_launchable.as_ref(),
            &source.runtime_version,
            &filters,
        ) {
            tracing::debug!(update_id = %manifest.id, "Selection policy declined remote manifest");
            return Ok(None);
        }
        if !on_manifest(&manifest) {
            tracing::debug!(update_id = %manifest.id, "Host declined remote manifest");
            return Ok(None);
        }

        let inserted = self
            .db
            .insert_pending_update(&source.scope_key, &manifest, body, &json_data)
            .await?;
        let update_id = inserted.id;

        if !inserted.inserted {
            if inserted.status != UpdateStatus::Pending {
                tracing::debug!(update_id = %update_id, status = %inserted.status, "Update already loaded");
                return Ok(None);
            }
            tracing::info!(update_id = %update_id, "Resuming partial load");
        }
        if inserted.status == UpdateStatus::Ready {
            metrics::ASSETS_DEDUPLICATED.inc_by(manifest.unique_assets().len() as u64);
            tracing::info!(update_id = %update_id, "All assets already stored, update ready");
            return Ok(Some(update_id));
        }

        guard.set(LoaderState::FetchingAssets);
        let base = Url::parse(&source.url)
            .map_err(|e| LoadError::ManifestInvalid(format!("invalid update url: {e}")))?;
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for asset in self.db.assets_for_update(update_id).await? {
            if asset.download_status == AssetStatus::Verified {
                metrics::ASSETS_DEDUPLICATED.inc();
            } else if seen.insert(asset.hash) {
                missing.push(asset);
            }
        }
        tracing::debug!(update_id = %update_id, missing = missing.len(), "Fetching assets");

        // Every asset settles before the load reports, so one bad asset does
        // not throw away the others' downloads.
        let outcomes: Vec<LoadResult<bool>> = futures::stream::iter(
            missing
                .into_iter()
                .map(|asset| self.commit_asset(guard, update_id, asset, &base, cancel)),
        )
        .buffer_unordered(self.config.max_concurrent_downloads.max(1))
        .collect()
        .await;

        let mut ready = false;
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Ok(flipped) => ready |= flipped,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if !ready {
            let status = self.db.get_update(update_id).await?.map(|u| u.status);
            if status != Some(UpdateStatus::Ready) {
                return Err(LoadError::Incomplete(update_id));
            }
        }

        tracing::info!(update_id = %update_id, "Update ready");
        Ok(Some(update_id))
    }

    async fn fetch_manifest(
        &self,
        source: &UpdateSource,
        cancel: &CancellationToken,
    ) -> LoadResult<FetchResponse> {
        let request_headers = self.request_headers(source).await?;
        let fetcher = &self.fetcher;
        let url = source.url.as_str();
        let request_headers = request_headers.as_slice();
        let timeout = self.config.manifest_timeout();

        with_retry(&self.config, cancel, "manifest", move || async move {
            with_timeout(timeout, cancel, fetcher.fetch(url, request_headers, None, None))
                .await?
                .error_for_status()
        })
        .await
    }

    /// Stored server-defined headers, configured headers, then protocol headers.
    async fn request_headers(&self, source: &UpdateSource) -> LoadResult<Vec<(String, String)>> {
        let mut request_headers = BTreeMap::new();

        if let Some(stored) = self
            .db
            .get_json_data(&source.scope_key, SERVER_DEFINED_HEADERS_KEY)
            .await?
        {
            match parse_header_object(&stored) {
                Ok(map) => request_headers.extend(map),
                Err(e) => tracing::warn!(error = %e, "Ignoring stored server-defined headers"),
            }
        }
        for (name, value) in &source.request_headers {
            request_headers.insert(name.to_ascii_lowercase(), value.clone());
        }
        if let Some(extra) = self
            .db
            .get_json_data(&source.scope_key, EXTRA_PARAMS_KEY)
            .await?
        {
            request_headers.insert(headers::EXTRA_PARAMS.to_string(), extra);
        }

        request_headers.insert("accept".to_string(), "application/json".to_string());
        request_headers.insert(
            headers::RUNTIME_VERSION.to_string(),
            source.runtime_version.clone(),
        );
        if let Some(current) = &source.current_launchable {
            request_headers.insert(headers::CURRENT_UPDATE_ID.to_string(), current.id.to_string());
        }
        if let Some(embedded) = source.embedded_update_id {
            request_headers.insert(headers::EMBEDDED_UPDATE_ID.to_string(), embedded.to_string());
        }

        Ok(request_headers.into_iter().collect())
    }

    async fn stored_filters(&self, scope_key: &str) -> LoadResult<ManifestFilters> {
        let Some(stored) = self
            .db
            .get_json_data(scope_key, MANIFEST_FILTERS_KEY)
            .await?
        else {
            return Ok(ManifestFilters::new());
        };
        Ok(ManifestFilters::from_json(&stored).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring stored manifest filters");
            ManifestFilters::new()
        }))
    }

    fn check_signature(&self, response: &FetchResponse) -> LoadResult<()> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };

        match response.header(headers::SIGNATURE) {
            Some(raw) => {
                let signature = SignatureHeader::parse(raw).map_err(|e| {
                    LoadError::ManifestInvalid(format!("malformed signature header: {e}"))
                })?;
                if !verifier.verify(&response.body, &signature) {
                    return Err(LoadError::ManifestInvalid(
                        "manifest signature verification failed".to_string(),
                    ));
                }
                Ok(())
            }
            None if self.signature_required => Err(LoadError::ManifestInvalid(
                "manifest is not signed".to_string(),
            )),
            None => {
                tracing::warn!("Accepting unsigned manifest");
                Ok(())
            }
        }
    }

    /// Fetch one asset, verify it and commit it under the commit gate.
    /// Returns whether this asset completed the update.
    async fn commit_asset(
        &self,
        guard: &StateGuard<'_>,
        update_id: UpdateId,
        asset: Asset,
        base: &Url,
        cancel: &CancellationToken,
    ) -> LoadResult<bool> {
        let item = self.obtain_asset(asset, base, cancel).await?;

        guard.advance(LoaderState::Verifying);
        self.verify_asset(&item).await?;
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        guard.advance(LoaderState::Committing);
        let _gate = self.commit_gate.read().await;
        self.store.put(&item.asset.hash, item.data).await?;
        let ready = self
            .db
            .mark_asset_verified(update_id, &item.asset.hash)
            .await?;
        tracing::debug!(key = %item.asset.key, hash = %item.asset.hash, "Asset committed");
        Ok(ready)
    }

    /// Reuse a stored blob if it is intact, otherwise download the asset.
    async fn obtain_asset(
        &self,
        asset: Asset,
        base: &Url,
        cancel: &CancellationToken,
    ) -> LoadResult<FetchedAsset> {
        if self.store.contains(&asset.hash).await? {
            match self.store.get(&asset.hash).await {
                Ok(data) => {
                    metrics::ASSETS_DEDUPLICATED.inc();
                    return Ok(FetchedAsset { asset, data });
                }
                Err(e @ StorageError::HashMismatch { .. }) => {
                    tracing::warn!(hash = %asset.hash, error = %e, "Replacing corrupt blob");
                    self.store.remove(&asset.hash).await?;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let raw_url = asset.url.as_deref().ok_or_else(|| {
            LoadError::ManifestInvalid(format!("asset {} has no url", asset.key))
        })?;
        let url = base.join(raw_url).map_err(|e| {
            LoadError::ManifestInvalid(format!("asset {} has invalid url: {e}", asset.key))
        })?;

        let fetcher = &self.fetcher;
        let url = url.as_str();
        let key = asset.key.as_str();
        let timeout = self.config.asset_timeout();
        let max_bytes = Some(asset.expected_size);
        let downloaded = with_retry(&self.config, cancel, key, move || async move {
            let progress = move |received: u64, total: Option<u64>| {
                tracing::trace!(key, received, total, "Asset download progress");
            };
            let response = with_timeout(
                timeout,
                cancel,
                fetcher.fetch(url, &[], max_bytes, Some(&progress as &ProgressFn<'_>)),
            )
            .await?
            .error_for_status()?;
            Ok::<_, LoadError>(response.body)
        })
        .await;
        let data = match downloaded {
            Ok(data) => data,
            Err(LoadError::SizeMismatch {
                expected, actual, ..
            }) => {
                let error = LoadError::SizeMismatch {
                    key: asset.key.clone(),
                    expected,
                    actual,
                };
                return Err(self.reject_asset(&asset, error).await);
            }
            Err(e) => return Err(e),
        };

        metrics::ASSETS_DOWNLOADED.inc();
        metrics::BYTES_DOWNLOADED.inc_by(data.len() as u64);
        tracing::debug!(key = %asset.key, bytes = data.len(), "Asset downloaded");
        Ok(FetchedAsset { asset, data })
    }

    /// Size then hash. A failure marks the asset `Failed`.
    async fn verify_asset(&self, item: &FetchedAsset) -> LoadResult<()> {
        let asset = &item.asset;
        let actual_size = item.data.len() as u64;
        let error = if actual_size != asset.expected_size {
            Some(LoadError::SizeMismatch {
                key: asset.key.clone(),
                expected: asset.expected_size,
                actual: actual_size,
            })
        } else {
            let actual = ContentHash::compute(&item.data);
            (actual != asset.hash).then(|| LoadError::HashMismatch {
                key: asset.key.clone(),
                expected: asset.hash.to_hex(),
                actual: actual.to_hex(),
            })
        };

        match error {
            Some(error) => Err(self.reject_asset(asset, error).await),
            None => Ok(()),
        }
    }

    /// Record an integrity failure against the asset and hand the error back.
    async fn reject_asset(&self, asset: &Asset, error: LoadError) -> LoadError {
        metrics::ASSET_HASH_MISMATCHES.inc();
        if let Err(e) = self
            .db
            .set_asset_status(&asset.hash, AssetStatus::Failed)
            .await
        {
            tracing::warn!(hash = %asset.hash, error = %e, "Failed to record asset failure");
        }
        error
    }
}

/// Parse a JSON object of header values. Non-scalar values are dropped.
fn parse_header_object(raw: &str) -> Result<BTreeMap<String, String>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map
            .into_iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((name.to_ascii_lowercase(), value))
            })
            .collect()),
        Ok(other) => Err(format!("expected a JSON object, got {other}")),
        Err(e) => Err(e.to_string()),
    }
}
