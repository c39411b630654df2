//! Test fixtures for manifests and asset content.
//!
//! Each test file compiles common/ separately, so some helpers go unused.
#![allow(dead_code)]

use bytes::Bytes;
use time::OffsetDateTime;
use updraft_core::{ContentHash, Manifest, ManifestAsset, UpdateId};

pub const RUNTIME: &str = "1.0.0";
pub const UPDATE_URL: &str = "https://updates.test/api/manifest";
pub const ASSET_BASE: &str = "https://updates.test/assets";

/// Fixed base for commit times; offsets are seconds after it.
pub const BASE_TIME: i64 = 1_700_000_000;

/// Generate deterministic test data based on a seed.
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    for chunk in data.chunks_mut(8) {
        // Simple LCG for deterministic data
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// One asset of a test update.
#[derive(Clone, Debug)]
pub struct TestAsset {
    pub key: String,
    pub content: Bytes,
}

impl TestAsset {
    pub fn new(key: &str, content: impl Into<Bytes>) -> Self {
        Self {
            key: key.to_string(),
            content: content.into(),
        }
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::compute(&self.content)
    }

    /// Where the remote server serves this asset.
    pub fn url(&self) -> String {
        format!("{ASSET_BASE}/{}", self.key)
    }

    fn entry(&self, with_url: bool, is_launch_asset: bool) -> ManifestAsset {
        ManifestAsset {
            key: self.key.clone(),
            hash: self.hash(),
            url: with_url.then(|| self.url()),
            size: self.content.len() as u64,
            content_type: None,
            is_launch_asset,
        }
    }
}

/// A remote manifest committed `offset_secs` after [`BASE_TIME`].
/// The first asset is the launch asset.
pub fn remote_manifest(offset_secs: i64, assets: &[TestAsset]) -> Manifest {
    build_manifest(offset_secs, assets, true)
}

/// A bundled manifest: no asset URLs.
pub fn embedded_manifest(offset_secs: i64, assets: &[TestAsset]) -> Manifest {
    build_manifest(offset_secs, assets, false)
}

fn build_manifest(offset_secs: i64, assets: &[TestAsset], with_urls: bool) -> Manifest {
    Manifest {
        id: UpdateId::new(),
        commit_time: OffsetDateTime::from_unix_timestamp(BASE_TIME + offset_secs)
            .expect("valid timestamp"),
        runtime_version: RUNTIME.to_string(),
        assets: assets
            .iter()
            .enumerate()
            .map(|(i, a)| a.entry(with_urls, i == 0))
            .collect(),
        metadata: serde_json::Map::new(),
    }
}

pub fn manifest_body(manifest: &Manifest) -> String {
    manifest.to_json().expect("manifest serializes")
}
