//! Core domain types and shared logic for the Updraft update engine.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes and their on-disk fan-out keys
//! - Update identifiers, statuses and launch outcomes
//! - The remote manifest wire format
//! - Manifest filters and rollout configuration
//! - Runtime version compatibility
//! - Engine configuration

pub mod config;
pub mod error;
pub mod filters;
pub mod hash;
pub mod manifest;
pub mod runtime;
pub mod update;

pub use error::{Error, Result};
pub use filters::{ManifestFilters, SelectionFilters};
pub use hash::{ContentHash, ContentHasher};
pub use manifest::{Manifest, ManifestAsset};
pub use runtime::RuntimeCompatibility;
pub use update::{Asset, AssetStatus, LaunchOutcome, LaunchRecord, Update, UpdateId, UpdateStatus};

/// Scope key used when neither the configuration nor the update URL provide one.
pub const DEFAULT_SCOPE_KEY: &str = "default";

/// Metadata field carrying a per-update rollout percentage.
pub const ROLLOUT_PERCENTAGE_FIELD: &str = "rolloutPercentage";
