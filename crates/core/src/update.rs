//! Update, asset and launch record types.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Unique identifier for an update.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId(Uuid);

impl UpdateId {
    /// Generate a new random update ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidUpdateId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UpdateId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UpdateId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for UpdateId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateId({})", self.0)
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Update lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    /// Manifest accepted, assets still downloading.
    Pending,
    /// Every asset is verified on disk.
    Ready,
    /// Shipped inside the host binary.
    Embedded,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Embedded => "embedded",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "embedded" => Ok(Self::Embedded),
            other => Err(crate::Error::InvalidStatus(format!("update status {other}"))),
        }
    }

    /// Check if an update in this status may be launched.
    pub fn is_launchable(&self) -> bool {
        matches!(self, Self::Ready | Self::Embedded)
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Asset download status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Downloaded,
    Verified,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloaded => "downloaded",
            Self::Verified => "verified",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloaded" => Ok(Self::Downloaded),
            "verified" => Ok(Self::Verified),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidStatus(format!("asset status {other}"))),
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single launch attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchOutcome {
    InProgress,
    Succeeded,
    Crashed,
    TimedOut,
}

impl LaunchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Crashed => "crashed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "succeeded" => Ok(Self::Succeeded),
            "crashed" => Ok(Self::Crashed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(crate::Error::InvalidStatus(format!("launch outcome {other}"))),
        }
    }

    /// Check if the launch has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }

    /// Check if the outcome counts as a failed launch.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Crashed | Self::TimedOut)
    }
}

/// A stored update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Update {
    pub id: UpdateId,
    pub scope_key: String,
    #[serde(with = "time::serde::rfc3339")]
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    /// Raw manifest document the update was accepted from.
    pub manifest_body: String,
    pub status: UpdateStatus,
    /// Set by the host; protects the update from reaping.
    pub keep: bool,
    /// Most recently launched update of its scope. Also protected.
    pub launched: bool,
    pub successful_launch_count: u32,
    pub failed_launch_count: u32,
    /// Failures since the last successful launch.
    pub consecutive_failure_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed: OffsetDateTime,
}

impl Update {
    /// The manifest's opaque `metadata` object, if the body carries one.
    pub fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_str::<serde_json::Value>(&self.manifest_body)
            .ok()
            .and_then(|v| match v {
                serde_json::Value::Object(mut obj) => match obj.remove("metadata") {
                    Some(serde_json::Value::Object(meta)) => Some(meta),
                    _ => None,
                },
                _ => None,
            })
            .unwrap_or_default()
    }

    /// Per-update rollout percentage declared in the manifest metadata.
    pub fn rollout_percentage(&self) -> Option<u8> {
        crate::manifest::rollout_percentage_of(&self.metadata())
    }

    pub fn is_embedded(&self) -> bool {
        self.status == UpdateStatus::Embedded
    }
}

/// An asset referenced by an update.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub hash: ContentHash,
    /// Logical name within the update (e.g. "main.bundle").
    pub key: String,
    pub content_type: Option<String>,
    pub expected_size: u64,
    pub url: Option<String>,
    pub download_status: AssetStatus,
    pub is_launch_asset: bool,
}

/// A single launch attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRecord {
    pub id: Uuid,
    pub update_id: UpdateId,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub outcome: LaunchOutcome,
}
