//! Configuration types shared across crates.

use crate::filters::SelectionFilters;
use crate::runtime::RuntimeCompatibility;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// When the engine checks the remote source on start.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckAutomatically {
    /// Check on every start.
    #[default]
    Always,
    /// Check only when the host reports an unmetered connection.
    WifiOnly,
    /// Only explicit checks.
    Never,
}

/// Network state reported by the host.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Wifi,
    Cellular,
    Offline,
    #[default]
    Unknown,
}

impl CheckAutomatically {
    /// Decide whether an automatic check may run on this network.
    pub fn allows(self, network: NetworkType) -> bool {
        match (self, network) {
            (_, NetworkType::Offline) => false,
            (Self::Never, _) => false,
            (Self::Always, _) => true,
            (Self::WifiOnly, NetworkType::Wifi) => true,
            (Self::WifiOnly, _) => false,
        }
    }
}

/// Asset store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for asset blobs.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/assets"),
        }
    }
}

/// Update database configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// How long a statement waits on a locked database, in seconds.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(30)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/updates.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Loader retry and timeout configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Attempts per manifest or asset fetch, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay; doubles on each further retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_manifest_timeout_ms")]
    pub manifest_timeout_ms: u64,
    /// Timeout for each individual asset fetch.
    #[serde(default = "default_asset_timeout_ms")]
    pub asset_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_manifest_timeout_ms() -> u64 {
    30_000
}

fn default_asset_timeout_ms() -> u64 {
    120_000
}

fn default_max_concurrent_downloads() -> usize {
    4
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            manifest_timeout_ms: default_manifest_timeout_ms(),
            asset_timeout_ms: default_asset_timeout_ms(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
        }
    }
}

impl LoaderConfig {
    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.manifest_timeout_ms)
    }

    pub fn asset_timeout(&self) -> Duration {
        Duration::from_millis(self.asset_timeout_ms)
    }

    /// Delay before retry number `retry` (1-based): base, 2*base, 4*base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u64 << retry.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("loader.max_attempts must be at least 1".to_string());
        }
        if self.max_concurrent_downloads == 0 {
            return Err("loader.max_concurrent_downloads must be at least 1".to_string());
        }
        if self.manifest_timeout_ms == 0 || self.asset_timeout_ms == 0 {
            return Err("loader timeouts must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Crash-loop recovery configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failed launches that put an update into recovery.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Fetch a fresh remote update when recovery starts.
    #[serde(default = "default_fetch_on_recovery")]
    pub fetch_on_recovery: bool,
}

fn default_failure_threshold() -> u32 {
    2
}

fn default_fetch_on_recovery() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            fetch_on_recovery: default_fetch_on_recovery(),
        }
    }
}

/// Manifest signature verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Trusted keys in `keyid:base64` form.
    pub public_keys: Vec<String>,
    /// Reject unsigned manifests.
    #[serde(default = "default_signature_required")]
    pub required: bool,
}

fn default_signature_required() -> bool {
    true
}

/// The update bundled with the host binary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddedConfig {
    /// Manifest JSON shipped with the binary.
    pub manifest_path: PathBuf,
    /// Directory holding the bundled assets, named by asset key.
    pub assets_dir: PathBuf,
}

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Remote manifest endpoint. Remote checks are disabled when absent.
    #[serde(default)]
    pub update_url: Option<String>,
    /// Tenant/channel discriminator. Defaults to the update URL origin.
    #[serde(default)]
    pub scope_key: Option<String>,
    /// Runtime version declared by the host.
    pub runtime_version: String,
    #[serde(default)]
    pub runtime_compatibility: RuntimeCompatibility,
    #[serde(default)]
    pub check_automatically: CheckAutomatically,
    /// How long `start` waits for a remote update before launching local state.
    #[serde(default)]
    pub launch_wait_timeout_ms: u64,
    #[serde(default)]
    pub rollout_filters: SelectionFilters,
    /// Extra headers sent with every manifest request.
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub signing: Option<SigningConfig>,
    #[serde(default)]
    pub embedded: Option<EmbeddedConfig>,
}

impl EngineConfig {
    /// Create a test configuration rooted at `root`.
    ///
    /// **For testing only.** No update URL, no signing, no embedded bundle.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            update_url: None,
            scope_key: Some("test-scope".to_string()),
            runtime_version: "1.0.0".to_string(),
            runtime_compatibility: RuntimeCompatibility::Exact,
            check_automatically: CheckAutomatically::Always,
            launch_wait_timeout_ms: 0,
            rollout_filters: SelectionFilters::default(),
            request_headers: BTreeMap::new(),
            storage: StorageConfig::Filesystem {
                path: root.join("assets"),
            },
            metadata: MetadataConfig::Sqlite {
                path: root.join("updates.db"),
                query_timeout_secs: None,
            },
            loader: LoaderConfig {
                backoff_base_ms: 10,
                ..LoaderConfig::default()
            },
            recovery: RecoveryConfig::default(),
            signing: None,
            embedded: None,
        }
    }

    /// The scope key updates are stored under.
    pub fn effective_scope_key(&self) -> String {
        if let Some(scope) = &self.scope_key {
            return scope.clone();
        }
        self.update_url
            .as_deref()
            .and_then(|u| url::Url::parse(u).ok())
            .map(|u| u.origin().ascii_serialization())
            .filter(|origin| origin != "null")
            .unwrap_or_else(|| crate::DEFAULT_SCOPE_KEY.to_string())
    }

    pub fn launch_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_wait_timeout_ms)
    }

    /// Validate configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.runtime_compatibility
            .validate_host(&self.runtime_version)
            .map_err(|e| e.to_string())?;
        if let Some(update_url) = &self.update_url {
            url::Url::parse(update_url).map_err(|e| format!("invalid update_url: {e}"))?;
        }
        if let Some(scope) = &self.scope_key
            && scope.trim().is_empty()
        {
            return Err("scope_key must not be empty".to_string());
        }
        if let Some(signing) = &self.signing
            && signing.public_keys.is_empty()
        {
            return Err("signing.public_keys must list at least one key".to_string());
        }
        if self.recovery.failure_threshold == 0 {
            return Err("recovery.failure_threshold must be at least 1".to_string());
        }
        self.rollout_filters.validate()?;
        self.loader.validate()
    }
}
