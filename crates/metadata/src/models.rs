//! Database models mapping to the update database schema.

use crate::error::{MetadataError, MetadataResult};
use sqlx::FromRow;
use time::OffsetDateTime;
use updraft_core::{
    Asset, AssetStatus, ContentHash, LaunchOutcome, LaunchRecord, Update, UpdateId, UpdateStatus,
};
use uuid::Uuid;

// =============================================================================
// Updates
// =============================================================================

/// Update record.
#[derive(Debug, Clone, FromRow)]
pub struct UpdateRow {
    pub id: Uuid,
    pub scope_key: String,
    pub commit_time: OffsetDateTime,
    pub runtime_version: String,
    pub manifest_body: String,
    pub status: String,
    pub keep: bool,
    pub launched: bool,
    pub successful_launch_count: i64,
    pub failed_launch_count: i64,
    pub consecutive_failure_count: i64,
    pub last_accessed: OffsetDateTime,
}

impl TryFrom<UpdateRow> for Update {
    type Error = MetadataError;

    fn try_from(row: UpdateRow) -> MetadataResult<Self> {
        Ok(Update {
            id: UpdateId::from_uuid(row.id),
            scope_key: row.scope_key,
            commit_time: row.commit_time,
            runtime_version: row.runtime_version,
            manifest_body: row.manifest_body,
            status: UpdateStatus::parse(&row.status)?,
            keep: row.keep,
            launched: row.launched,
            successful_launch_count: count(row.successful_launch_count),
            failed_launch_count: count(row.failed_launch_count),
            consecutive_failure_count: count(row.consecutive_failure_count),
            last_accessed: row.last_accessed,
        })
    }
}

fn count(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

// =============================================================================
// Assets
// =============================================================================

/// Asset record, one per content hash.
#[derive(Debug, Clone, FromRow)]
pub struct AssetRow {
    pub hash: String,
    pub content_type: Option<String>,
    pub expected_size: i64,
    pub download_status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// An asset as seen through one update's join row.
#[derive(Debug, Clone, FromRow)]
pub struct UpdateAssetRow {
    pub asset_hash: String,
    pub asset_key: String,
    pub url: Option<String>,
    pub is_launch_asset: bool,
    pub content_type: Option<String>,
    pub expected_size: i64,
    pub download_status: String,
}

impl TryFrom<UpdateAssetRow> for Asset {
    type Error = MetadataError;

    fn try_from(row: UpdateAssetRow) -> MetadataResult<Self> {
        Ok(Asset {
            hash: ContentHash::from_hex(&row.asset_hash)?,
            key: row.asset_key,
            content_type: row.content_type,
            expected_size: u64::try_from(row.expected_size.max(0)).unwrap_or_default(),
            url: row.url,
            download_status: AssetStatus::parse(&row.download_status)?,
            is_launch_asset: row.is_launch_asset,
        })
    }
}

// =============================================================================
// Launch records
// =============================================================================

/// A single launch attempt.
#[derive(Debug, Clone, FromRow)]
pub struct LaunchRecordRow {
    pub id: Uuid,
    pub update_id: Uuid,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub outcome: String,
}

impl TryFrom<LaunchRecordRow> for LaunchRecord {
    type Error = MetadataError;

    fn try_from(row: LaunchRecordRow) -> MetadataResult<Self> {
        Ok(LaunchRecord {
            id: row.id,
            update_id: UpdateId::from_uuid(row.update_id),
            started_at: row.started_at,
            finished_at: row.finished_at,
            outcome: LaunchOutcome::parse(&row.outcome)?,
        })
    }
}

// =============================================================================
// Key-value scope
// =============================================================================

/// A JSON value stored under `(scope_key, key)`.
#[derive(Debug, Clone, FromRow)]
pub struct JsonDataRow {
    pub scope_key: String,
    pub data_key: String,
    pub value: String,
    pub updated_at: OffsetDateTime,
}
