//! Remote manifest wire format.

use crate::hash::ContentHash;
use crate::update::UpdateId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use time::OffsetDateTime;

/// A manifest describing one update and the assets it needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: UpdateId,
    #[serde(with = "time::serde::rfc3339")]
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    pub assets: Vec<ManifestAsset>,
    /// Opaque metadata read by selection policies.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// One asset entry in a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestAsset {
    pub key: String,
    pub hash: ContentHash,
    /// Download location. Embedded manifests omit it.
    #[serde(default)]
    pub url: Option<String>,
    pub size: u64,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub is_launch_asset: bool,
}

impl Manifest {
    /// Parse and validate a manifest document.
    pub fn from_json(bytes: &[u8]) -> crate::Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Check structural invariants.
    pub fn validate(&self) -> crate::Result<()> {
        if self.runtime_version.trim().is_empty() {
            return Err(crate::Error::ManifestInvalid(
                "runtimeVersion must not be empty".to_string(),
            ));
        }
        if self.assets.is_empty() {
            return Err(crate::Error::ManifestInvalid(
                "manifest lists no assets".to_string(),
            ));
        }

        let mut keys = HashSet::new();
        for asset in &self.assets {
            if asset.key.is_empty() {
                return Err(crate::Error::ManifestInvalid(
                    "asset key must not be empty".to_string(),
                ));
            }
            if !keys.insert(asset.key.as_str()) {
                return Err(crate::Error::ManifestInvalid(format!(
                    "duplicate asset key: {}",
                    asset.key
                )));
            }
        }

        let launch_assets = self.assets.iter().filter(|a| a.is_launch_asset).count();
        if launch_assets > 1 {
            return Err(crate::Error::ManifestInvalid(format!(
                "expected at most one launch asset, found {launch_assets}"
            )));
        }
        Ok(())
    }

    /// Require a download URL on every asset.
    pub fn validate_remote(&self) -> crate::Result<()> {
        self.validate()?;
        if let Some(asset) = self.assets.iter().find(|a| a.url.is_none()) {
            return Err(crate::Error::ManifestInvalid(format!(
                "asset {} has no url",
                asset.key
            )));
        }
        Ok(())
    }

    pub fn launch_asset(&self) -> Option<&ManifestAsset> {
        self.assets.iter().find(|a| a.is_launch_asset)
    }

    /// Assets with distinct hashes, first occurrence wins.
    pub fn unique_assets(&self) -> Vec<&ManifestAsset> {
        let mut seen = HashSet::new();
        self.assets
            .iter()
            .filter(|a| seen.insert(a.hash))
            .collect()
    }

    pub fn rollout_percentage(&self) -> Option<u8> {
        rollout_percentage_of(&self.metadata)
    }
}

/// Read a 0..=100 rollout percentage from manifest metadata.
pub(crate) fn rollout_percentage_of(
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> Option<u8> {
    metadata
        .get(crate::ROLLOUT_PERCENTAGE_FIELD)
        .and_then(|v| v.as_u64())
        .and_then(|p| u8::try_from(p.min(100)).ok())
}
