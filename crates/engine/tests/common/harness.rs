//! Engine test environment.

use super::fetcher::MockFetcher;
use super::fixtures::{TestAsset, UPDATE_URL, embedded_manifest, manifest_body, remote_manifest};
use std::sync::Arc;
use tempfile::TempDir;
use updraft_core::config::{EmbeddedConfig, EngineConfig};
use updraft_core::{Manifest, Update, UpdateId};
use updraft_engine::UpdateEngine;

/// A temp directory, a test configuration and a mock remote server.
pub struct TestEnv {
    pub config: EngineConfig,
    pub fetcher: Arc<MockFetcher>,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEnv {
    pub fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let mut config = EngineConfig::for_testing(temp_dir.path());
        config.update_url = Some(UPDATE_URL.to_string());
        config.loader.backoff_base_ms = 1;

        Self {
            config,
            fetcher: Arc::new(MockFetcher::new()),
            temp_dir,
        }
    }

    /// Like [`TestEnv::new`] with a bundled update committed at offset 0.
    pub fn with_embedded(assets: &[TestAsset]) -> (Self, Manifest) {
        let mut env = Self::new();
        let manifest = env.write_bundle(0, assets);
        (env, manifest)
    }

    /// Write a bundle to disk and point the configuration at it.
    pub fn write_bundle(&mut self, offset_secs: i64, assets: &[TestAsset]) -> Manifest {
        let bundle = self.temp_dir.path().join("bundle");
        let assets_dir = bundle.join("assets");
        std::fs::create_dir_all(&assets_dir).expect("Failed to create bundle dir");
        for asset in assets {
            std::fs::write(assets_dir.join(&asset.key), &asset.content)
                .expect("Failed to write bundled asset");
        }

        let manifest = embedded_manifest(offset_secs, assets);
        let manifest_path = bundle.join("manifest.json");
        std::fs::write(&manifest_path, manifest_body(&manifest))
            .expect("Failed to write bundled manifest");

        self.config.embedded = Some(EmbeddedConfig {
            manifest_path,
            assets_dir,
        });
        manifest
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }

    pub async fn open(&self) -> UpdateEngine {
        UpdateEngine::builder(self.config.clone())
            .fetcher(self.fetcher.clone())
            .open()
            .await
            .expect("Failed to open engine")
    }

    /// Serve a new remote update and its assets.
    pub fn publish(&self, offset_secs: i64, assets: &[TestAsset]) -> Manifest {
        let manifest = remote_manifest(offset_secs, assets);
        self.fetcher.serve_manifest(UPDATE_URL, &manifest, &[]);
        self.fetcher.serve_assets(assets);
        manifest
    }
}

#[allow(dead_code)]
pub async fn get_update(engine: &UpdateEngine, id: UpdateId) -> Update {
    engine
        .database()
        .get_update(id)
        .await
        .expect("Failed to read update")
        .expect("Update not found")
}

#[allow(dead_code)]
pub async fn update_count(engine: &UpdateEngine) -> usize {
    engine
        .database()
        .updates_for_scope(engine.scope_key())
        .await
        .expect("Failed to list updates")
        .len()
}
