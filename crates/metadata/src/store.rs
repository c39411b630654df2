//! Update database trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{JsonDataRepo, LaunchRepo, UpdateRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined update database trait.
#[async_trait]
pub trait UpdateDatabase: UpdateRepo + LaunchRepo + JsonDataRepo + Send + Sync {
    /// Create or upgrade the schema.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based update database.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let busy_timeout = Duration::from_secs(query_timeout_secs.unwrap_or(5));

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(busy_timeout);

        let pool = SqlitePoolOptions::new()
            // One connection serializes writers; the launcher, loader and
            // recovery paths all share this pool.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(path = %path.display(), "Update database opened");
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl UpdateDatabase for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Status transitions shared by several write paths. Each runs inside the
// caller's transaction.

/// Flip every `Pending` update whose assets are all verified to `Ready`.
async fn promote_ready_updates(conn: &mut SqliteConnection) -> MetadataResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE updates SET status = 'ready'
        WHERE status = 'pending'
          AND EXISTS (SELECT 1 FROM updates_assets ua WHERE ua.update_id = updates.id)
          AND NOT EXISTS (
              SELECT 1 FROM updates_assets ua
              JOIN assets a ON a.hash = ua.asset_hash
              WHERE ua.update_id = updates.id AND a.download_status != 'verified'
          )
        "#,
    )
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Demote `Ready` updates referencing `hash` back to `Pending`.
async fn demote_updates_referencing(
    conn: &mut SqliteConnection,
    hash: &str,
) -> MetadataResult<Vec<uuid::Uuid>> {
    let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT u.id FROM updates u
        JOIN updates_assets ua ON ua.update_id = u.id
        WHERE ua.asset_hash = ? AND u.status = 'ready'
        "#,
    )
    .bind(hash)
    .fetch_all(&mut *conn)
    .await?;

    for id in &ids {
        sqlx::query("UPDATE updates SET status = 'pending' WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(ids)
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::InsertedUpdate;
    use std::collections::{BTreeMap, HashSet};
    use time::OffsetDateTime;
    use updraft_core::{
        Asset, AssetStatus, ContentHash, LaunchOutcome, LaunchRecord, Manifest, ManifestAsset,
        Update, UpdateId, UpdateStatus,
    };
    use uuid::Uuid;

    /// Newest commit first, ties by id. Stored timestamps are text with
    /// variable sub-second precision, so ordering is settled here.
    fn sort_newest_first(updates: &mut [Update]) {
        updates.sort_by(|a, b| {
            b.commit_time
                .cmp(&a.commit_time)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    fn to_updates(rows: Vec<UpdateRow>) -> MetadataResult<Vec<Update>> {
        rows.into_iter().map(Update::try_from).collect()
    }

    async fn fetch_update(conn: &mut SqliteConnection, id: UpdateId) -> MetadataResult<Update> {
        let row = sqlx::query_as::<_, UpdateRow>("SELECT * FROM updates WHERE id = ?")
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("update {id}")))?;
        row.try_into()
    }

    async fn insert_asset(
        conn: &mut SqliteConnection,
        asset: &ManifestAsset,
        verified: bool,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        // An existing row keeps its status unless the caller vouches for the blob.
        let sql = if verified {
            r#"
            INSERT INTO assets (hash, content_type, expected_size, download_status, created_at, updated_at)
            VALUES (?, ?, ?, 'verified', ?, ?)
            ON CONFLICT(hash) DO UPDATE SET download_status = 'verified', updated_at = excluded.updated_at
            "#
        } else {
            r#"
            INSERT INTO assets (hash, content_type, expected_size, download_status, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(hash) DO NOTHING
            "#
        };
        sqlx::query(sql)
            .bind(asset.hash.to_hex())
            .bind(&asset.content_type)
            .bind(i64::try_from(asset.size).unwrap_or(i64::MAX))
            .bind(now)
            .bind(now)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn link_asset(
        conn: &mut SqliteConnection,
        update_id: UpdateId,
        asset: &ManifestAsset,
    ) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO updates_assets (update_id, asset_hash, asset_key, url, is_launch_asset)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(update_id, asset_key) DO NOTHING
            "#,
        )
        .bind(update_id.as_uuid())
        .bind(asset.hash.to_hex())
        .bind(&asset.key)
        .bind(&asset.url)
        .bind(asset.is_launch_asset)
        .execute(conn)
        .await?;
        Ok(())
    }

    async fn upsert_json_data(
        conn: &mut SqliteConnection,
        scope_key: &str,
        values: &BTreeMap<String, String>,
        now: OffsetDateTime,
    ) -> MetadataResult<()> {
        for (key, value) in values {
            sqlx::query(
                r#"
                INSERT INTO json_data (scope_key, data_key, value, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(scope_key, data_key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(scope_key)
            .bind(key)
            .bind(value)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn apply_launch_outcome(
        conn: &mut SqliteConnection,
        id: UpdateId,
        succeeded: bool,
    ) -> MetadataResult<Update> {
        let sql = if succeeded {
            "UPDATE updates SET successful_launch_count = successful_launch_count + 1, \
             consecutive_failure_count = 0 WHERE id = ?"
        } else {
            "UPDATE updates SET failed_launch_count = failed_launch_count + 1, \
             consecutive_failure_count = consecutive_failure_count + 1 WHERE id = ?"
        };
        let result = sqlx::query(sql)
            .bind(id.as_uuid())
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("update {id}")));
        }
        fetch_update(conn, id).await
    }

    #[async_trait]
    impl UpdateRepo for SqliteStore {
        async fn insert_pending_update(
            &self,
            scope_key: &str,
            manifest: &Manifest,
            manifest_body: &str,
            json_data: &BTreeMap<String, String>,
        ) -> MetadataResult<InsertedUpdate> {
            let now = OffsetDateTime::now_utc();
            let id = manifest.id;
            let mut tx = self.pool.begin().await?;

            // ON CONFLICT DO NOTHING lets a concurrent loader of the same
            // manifest lose the race without an error.
            let result = sqlx::query(
                r#"
                INSERT INTO updates (
                    id, scope_key, commit_time, runtime_version, manifest_body,
                    status, keep, last_accessed
                ) VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(id.as_uuid())
            .bind(scope_key)
            .bind(manifest.commit_time)
            .bind(&manifest.runtime_version)
            .bind(manifest_body)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            let inserted = result.rows_affected() == 1;

            if inserted {
                for asset in &manifest.assets {
                    insert_asset(&mut tx, asset, false, now).await?;
                    link_asset(&mut tx, id, asset).await?;
                }
            } else {
                let existing_scope: String =
                    sqlx::query_scalar("SELECT scope_key FROM updates WHERE id = ?")
                        .bind(id.as_uuid())
                        .fetch_one(&mut *tx)
                        .await?;
                if existing_scope != scope_key {
                    return Err(MetadataError::AlreadyExists(format!(
                        "update {id} belongs to scope {existing_scope}"
                    )));
                }
            }

            upsert_json_data(&mut tx, scope_key, json_data, now).await?;
            promote_ready_updates(&mut tx).await?;

            let status: String = sqlx::query_scalar("SELECT status FROM updates WHERE id = ?")
                .bind(id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;

            Ok(InsertedUpdate {
                id,
                inserted,
                status: UpdateStatus::parse(&status)?,
            })
        }

        async fn install_embedded_update(
            &self,
            scope_key: &str,
            manifest: &Manifest,
            manifest_body: &str,
        ) -> MetadataResult<bool> {
            let now = OffsetDateTime::now_utc();
            let id = manifest.id;
            let mut tx = self.pool.begin().await?;

            let existing: Option<(String, String)> =
                sqlx::query_as("SELECT scope_key, status FROM updates WHERE id = ?")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some((existing_scope, status)) = &existing {
                if existing_scope != scope_key {
                    return Err(MetadataError::AlreadyExists(format!(
                        "update {id} belongs to scope {existing_scope}"
                    )));
                }
                if status == UpdateStatus::Embedded.as_str() {
                    return Ok(false);
                }
            }

            // Demote first: at most one embedded row per scope is enforced by index.
            let demoted = sqlx::query(
                "UPDATE updates SET status = 'pending' WHERE scope_key = ? AND status = 'embedded'",
            )
            .bind(scope_key)
            .execute(&mut *tx)
            .await?;

            for asset in &manifest.assets {
                insert_asset(&mut tx, asset, true, now).await?;
            }

            if existing.is_some() {
                sqlx::query("UPDATE updates SET status = 'embedded' WHERE id = ?")
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query(
                    r#"
                    INSERT INTO updates (
                        id, scope_key, commit_time, runtime_version, manifest_body,
                        status, keep, last_accessed
                    ) VALUES (?, ?, ?, ?, ?, 'embedded', 0, ?)
                    "#,
                )
                .bind(id.as_uuid())
                .bind(scope_key)
                .bind(manifest.commit_time)
                .bind(&manifest.runtime_version)
                .bind(manifest_body)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            for asset in &manifest.assets {
                link_asset(&mut tx, id, asset).await?;
            }

            promote_ready_updates(&mut tx).await?;
            tx.commit().await?;

            tracing::info!(
                update_id = %id,
                scope_key = %scope_key,
                demoted = demoted.rows_affected(),
                "Embedded update installed"
            );
            Ok(true)
        }

        async fn mark_asset_verified(
            &self,
            update_id: UpdateId,
            hash: &ContentHash,
        ) -> MetadataResult<bool> {
            let now = OffsetDateTime::now_utc();
            let hex = hash.to_hex();
            let mut tx = self.pool.begin().await?;

            let before: Option<String> = sqlx::query_scalar(
                r#"
                SELECT u.status FROM updates u
                JOIN updates_assets ua ON ua.update_id = u.id
                WHERE u.id = ? AND ua.asset_hash = ?
                LIMIT 1
                "#,
            )
            .bind(update_id.as_uuid())
            .bind(&hex)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(before) = before else {
                return Err(MetadataError::NotFound(format!(
                    "asset {hex} of update {update_id}"
                )));
            };

            sqlx::query("UPDATE assets SET download_status = 'verified', updated_at = ? WHERE hash = ?")
                .bind(now)
                .bind(&hex)
                .execute(&mut *tx)
                .await?;
            promote_ready_updates(&mut tx).await?;

            let after: String = sqlx::query_scalar("SELECT status FROM updates WHERE id = ?")
                .bind(update_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
            tx.commit().await?;

            Ok(before == UpdateStatus::Pending.as_str() && after == UpdateStatus::Ready.as_str())
        }

        async fn asset_status(&self, hash: &ContentHash) -> MetadataResult<Option<AssetStatus>> {
            let row = sqlx::query_as::<_, AssetRow>("SELECT * FROM assets WHERE hash = ?")
                .bind(hash.to_hex())
                .fetch_optional(&self.pool)
                .await?;
            row.map(|r| AssetStatus::parse(&r.download_status).map_err(MetadataError::from))
                .transpose()
        }

        async fn set_asset_status(
            &self,
            hash: &ContentHash,
            status: AssetStatus,
        ) -> MetadataResult<()> {
            let hex = hash.to_hex();
            let mut tx = self.pool.begin().await?;

            let result =
                sqlx::query("UPDATE assets SET download_status = ?, updated_at = ? WHERE hash = ?")
                    .bind(status.as_str())
                    .bind(OffsetDateTime::now_utc())
                    .bind(&hex)
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("asset {hex}")));
            }

            if status == AssetStatus::Verified {
                promote_ready_updates(&mut tx).await?;
            } else {
                demote_updates_referencing(&mut tx, &hex).await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn mark_missing_assets(
            &self,
            hashes: &[ContentHash],
        ) -> MetadataResult<Vec<UpdateId>> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            let mut demoted = Vec::new();

            for hash in hashes {
                let hex = hash.to_hex();
                sqlx::query(
                    "UPDATE assets SET download_status = 'pending', updated_at = ? WHERE hash = ?",
                )
                .bind(now)
                .bind(&hex)
                .execute(&mut *tx)
                .await?;
                for id in demote_updates_referencing(&mut tx, &hex).await? {
                    let id = UpdateId::from_uuid(id);
                    if !demoted.contains(&id) {
                        demoted.push(id);
                    }
                }
            }

            tx.commit().await?;
            if !demoted.is_empty() {
                tracing::warn!(
                    missing = hashes.len(),
                    demoted = demoted.len(),
                    "Missing assets reset; affected updates need reloading"
                );
            }
            Ok(demoted)
        }

        async fn updates_for_scope(&self, scope_key: &str) -> MetadataResult<Vec<Update>> {
            let rows = sqlx::query_as::<_, UpdateRow>(
                "SELECT * FROM updates WHERE scope_key = ? ORDER BY commit_time DESC, id",
            )
            .bind(scope_key)
            .fetch_all(&self.pool)
            .await?;
            let mut updates = to_updates(rows)?;
            sort_newest_first(&mut updates);
            Ok(updates)
        }

        async fn get_update(&self, id: UpdateId) -> MetadataResult<Option<Update>> {
            let row = sqlx::query_as::<_, UpdateRow>("SELECT * FROM updates WHERE id = ?")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
            row.map(Update::try_from).transpose()
        }

        async fn assets_for_update(&self, id: UpdateId) -> MetadataResult<Vec<Asset>> {
            let rows = sqlx::query_as::<_, UpdateAssetRow>(
                r#"
                SELECT ua.asset_hash, ua.asset_key, ua.url, ua.is_launch_asset,
                       a.content_type, a.expected_size, a.download_status
                FROM updates_assets ua
                JOIN assets a ON a.hash = ua.asset_hash
                WHERE ua.update_id = ?
                ORDER BY ua.asset_key
                "#,
            )
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(Asset::try_from).collect()
        }

        async fn set_keep_flag(&self, id: UpdateId, keep: bool) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE updates SET keep = ? WHERE id = ?")
                .bind(keep)
                .bind(id.as_uuid())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("update {id}")));
            }
            Ok(())
        }

        async fn mark_launched(&self, scope_key: &str, id: UpdateId) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let result =
                sqlx::query("UPDATE updates SET launched = 1 WHERE id = ? AND scope_key = ?")
                    .bind(id.as_uuid())
                    .bind(scope_key)
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "update {id} in scope {scope_key}"
                )));
            }
            sqlx::query(
                "UPDATE updates SET launched = 0 WHERE scope_key = ? AND id != ? AND launched = 1",
            )
            .bind(scope_key)
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(())
        }

        async fn increment_launch_outcome(
            &self,
            id: UpdateId,
            succeeded: bool,
        ) -> MetadataResult<Update> {
            let mut tx = self.pool.begin().await?;
            let update = apply_launch_outcome(&mut tx, id, succeeded).await?;
            tx.commit().await?;
            Ok(update)
        }

        async fn mark_update_accessed(&self, id: UpdateId) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE updates SET last_accessed = ? WHERE id = ?")
                .bind(OffsetDateTime::now_utc())
                .bind(id.as_uuid())
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("update {id}")));
            }
            Ok(())
        }

        async fn recent_update_ids_with_failed_launch(
            &self,
            scope_key: &str,
            limit: usize,
        ) -> MetadataResult<Vec<UpdateId>> {
            let rows = sqlx::query_as::<_, UpdateRow>(
                "SELECT * FROM updates WHERE scope_key = ? AND failed_launch_count > 0",
            )
            .bind(scope_key)
            .fetch_all(&self.pool)
            .await?;
            let mut updates = to_updates(rows)?;
            sort_newest_first(&mut updates);
            Ok(updates.into_iter().take(limit).map(|u| u.id).collect())
        }

        async fn delete_updates(&self, ids: &HashSet<UpdateId>) -> MetadataResult<usize> {
            if ids.is_empty() {
                return Ok(0);
            }

            let mut ids: Vec<UpdateId> = ids.iter().copied().collect();
            ids.sort();

            let mut tx = self.pool.begin().await?;

            let mut protected = Vec::new();
            let mut present = Vec::new();
            for id in ids {
                let row: Option<(bool, bool, String)> =
                    sqlx::query_as("SELECT keep, launched, status FROM updates WHERE id = ?")
                        .bind(id.as_uuid())
                        .fetch_optional(&mut *tx)
                        .await?;
                match row {
                    Some((keep, launched, status))
                        if keep || launched || status == UpdateStatus::Embedded.as_str() =>
                    {
                        protected.push(id)
                    }
                    Some(_) => present.push(id),
                    None => {}
                }
            }

            if !protected.is_empty() {
                // Dropping the transaction rolls it back.
                return Err(MetadataError::ProtectedUpdate { ids: protected });
            }

            for id in &present {
                // updates_assets and launch_records cascade
                sqlx::query("DELETE FROM updates WHERE id = ?")
                    .bind(id.as_uuid())
                    .execute(&mut *tx)
                    .await?;
            }
            let orphans = sqlx::query(
                "DELETE FROM assets WHERE hash NOT IN (SELECT asset_hash FROM updates_assets)",
            )
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            tracing::debug!(
                deleted = present.len(),
                orphan_assets = orphans.rows_affected(),
                "Updates deleted"
            );
            Ok(present.len())
        }

        async fn live_asset_hashes(&self) -> MetadataResult<HashSet<ContentHash>> {
            let rows: Vec<String> =
                sqlx::query_scalar("SELECT DISTINCT asset_hash FROM updates_assets")
                    .fetch_all(&self.pool)
                    .await?;
            rows.iter()
                .map(|hex| ContentHash::from_hex(hex).map_err(MetadataError::from))
                .collect()
        }
    }

    #[async_trait]
    impl LaunchRepo for SqliteStore {
        async fn begin_launch(&self, update_id: UpdateId) -> MetadataResult<LaunchRecord> {
            let record = LaunchRecord {
                id: Uuid::new_v4(),
                update_id,
                started_at: OffsetDateTime::now_utc(),
                finished_at: None,
                outcome: LaunchOutcome::InProgress,
            };

            let result = sqlx::query(
                r#"
                INSERT INTO launch_records (id, update_id, started_at, finished_at, outcome)
                SELECT ?, id, ?, NULL, ? FROM updates WHERE id = ?
                "#,
            )
            .bind(record.id)
            .bind(record.started_at)
            .bind(record.outcome.as_str())
            .bind(update_id.as_uuid())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("update {update_id}")));
            }
            Ok(record)
        }

        async fn finish_launch(
            &self,
            launch_id: Uuid,
            outcome: LaunchOutcome,
        ) -> MetadataResult<(LaunchRecord, Update)> {
            if !outcome.is_terminal() {
                return Err(MetadataError::InvalidStateTransition {
                    from: LaunchOutcome::InProgress.as_str().to_string(),
                    to: outcome.as_str().to_string(),
                });
            }

            let mut tx = self.pool.begin().await?;

            let row =
                sqlx::query_as::<_, LaunchRecordRow>("SELECT * FROM launch_records WHERE id = ?")
                    .bind(launch_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("launch {launch_id}")))?;
            let mut record = LaunchRecord::try_from(row)?;
            if record.outcome.is_terminal() {
                return Err(MetadataError::InvalidStateTransition {
                    from: record.outcome.as_str().to_string(),
                    to: outcome.as_str().to_string(),
                });
            }

            let finished_at = OffsetDateTime::now_utc();
            sqlx::query("UPDATE launch_records SET outcome = ?, finished_at = ? WHERE id = ?")
                .bind(outcome.as_str())
                .bind(finished_at)
                .bind(launch_id)
                .execute(&mut *tx)
                .await?;
            let update = apply_launch_outcome(&mut tx, record.update_id, !outcome.is_failure())
                .await?;

            tx.commit().await?;

            record.outcome = outcome;
            record.finished_at = Some(finished_at);
            Ok((record, update))
        }

        async fn interrupted_launches(&self) -> MetadataResult<Vec<LaunchRecord>> {
            let rows = sqlx::query_as::<_, LaunchRecordRow>(
                "SELECT * FROM launch_records WHERE outcome = 'in_progress'",
            )
            .fetch_all(&self.pool)
            .await?;
            let mut records = rows
                .into_iter()
                .map(LaunchRecord::try_from)
                .collect::<MetadataResult<Vec<_>>>()?;
            records.sort_by_key(|r| r.started_at);
            Ok(records)
        }

        async fn launches_for_update(
            &self,
            update_id: UpdateId,
            limit: usize,
        ) -> MetadataResult<Vec<LaunchRecord>> {
            let rows = sqlx::query_as::<_, LaunchRecordRow>(
                "SELECT * FROM launch_records WHERE update_id = ?",
            )
            .bind(update_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
            let mut records = rows
                .into_iter()
                .map(LaunchRecord::try_from)
                .collect::<MetadataResult<Vec<_>>>()?;
            records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            records.truncate(limit);
            Ok(records)
        }
    }

    #[async_trait]
    impl JsonDataRepo for SqliteStore {
        async fn get_json_data(&self, scope_key: &str, key: &str) -> MetadataResult<Option<String>> {
            let row = sqlx::query_as::<_, JsonDataRow>(
                "SELECT * FROM json_data WHERE scope_key = ? AND data_key = ?",
            )
            .bind(scope_key)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(|r| r.value))
        }

        async fn set_json_data(&self, scope_key: &str, key: &str, value: &str) -> MetadataResult<()> {
            let values = BTreeMap::from([(key.to_string(), value.to_string())]);
            self.set_json_data_many(scope_key, &values).await
        }

        async fn set_json_data_many(
            &self,
            scope_key: &str,
            values: &BTreeMap<String, String>,
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            upsert_json_data(&mut tx, scope_key, values, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;
            Ok(())
        }

        async fn delete_json_data(&self, scope_key: &str, key: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM json_data WHERE scope_key = ? AND data_key = ?")
                .bind(scope_key)
                .bind(key)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn append_json_list(
            &self,
            scope_key: &str,
            key: &str,
            item: &str,
            max_len: usize,
        ) -> MetadataResult<usize> {
            let item: serde_json::Value = serde_json::from_str(item)
                .map_err(|e| MetadataError::Constraint(format!("invalid JSON item: {e}")))?;

            let mut tx = self.pool.begin().await?;
            let existing: Option<String> = sqlx::query_scalar(
                "SELECT value FROM json_data WHERE scope_key = ? AND data_key = ?",
            )
            .bind(scope_key)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            let mut items = match existing.as_deref().map(serde_json::from_str) {
                Some(Ok(serde_json::Value::Array(items))) => items,
                Some(_) => {
                    tracing::warn!(scope_key, key, "Replacing non-array JSON value");
                    Vec::new()
                }
                None => Vec::new(),
            };
            items.push(item);
            if items.len() > max_len {
                let excess = items.len() - max_len;
                items.drain(..excess);
            }
            let len = items.len();

            let values = BTreeMap::from([(
                key.to_string(),
                serde_json::Value::Array(items).to_string(),
            )]);
            upsert_json_data(&mut tx, scope_key, &values, OffsetDateTime::now_utc()).await?;
            tx.commit().await?;
            Ok(len)
        }

        async fn take_json_data(
            &self,
            scope_key: &str,
            key: &str,
        ) -> MetadataResult<Option<String>> {
            let value: Option<String> = sqlx::query_scalar(
                "DELETE FROM json_data WHERE scope_key = ? AND data_key = ? RETURNING value",
            )
            .bind(scope_key)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
            Ok(value)
        }
    }
}

const SCHEMA_SQL: &str = r#"
-- Updates
CREATE TABLE IF NOT EXISTS updates (
    id BLOB PRIMARY KEY,
    scope_key TEXT NOT NULL,
    commit_time TEXT NOT NULL,
    runtime_version TEXT NOT NULL,
    manifest_body TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('pending', 'ready', 'embedded')),
    keep INTEGER NOT NULL DEFAULT 0,
    -- The update most recently launched in its scope; protected like keep
    launched INTEGER NOT NULL DEFAULT 0,
    successful_launch_count INTEGER NOT NULL DEFAULT 0,
    failed_launch_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failure_count INTEGER NOT NULL DEFAULT 0,
    last_accessed TEXT NOT NULL,
    UNIQUE (scope_key, id)
);
CREATE INDEX IF NOT EXISTS idx_updates_scope ON updates(scope_key, commit_time);
-- Exactly one embedded update per scope
CREATE UNIQUE INDEX IF NOT EXISTS idx_updates_embedded ON updates(scope_key) WHERE status = 'embedded';

-- Assets, one row per content hash
CREATE TABLE IF NOT EXISTS assets (
    hash TEXT PRIMARY KEY,
    content_type TEXT,
    expected_size INTEGER NOT NULL,
    download_status TEXT NOT NULL CHECK (download_status IN ('pending', 'downloaded', 'verified', 'failed')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Update to asset join; the same hash may appear under several keys and updates
CREATE TABLE IF NOT EXISTS updates_assets (
    update_id BLOB NOT NULL REFERENCES updates(id) ON DELETE CASCADE,
    asset_hash TEXT NOT NULL REFERENCES assets(hash),
    asset_key TEXT NOT NULL,
    url TEXT,
    is_launch_asset INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (update_id, asset_key)
);
CREATE INDEX IF NOT EXISTS idx_updates_assets_hash ON updates_assets(asset_hash);

-- Launch attempts
CREATE TABLE IF NOT EXISTS launch_records (
    id BLOB PRIMARY KEY,
    update_id BLOB NOT NULL REFERENCES updates(id) ON DELETE CASCADE,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    outcome TEXT NOT NULL CHECK (outcome IN ('in_progress', 'succeeded', 'crashed', 'timed_out'))
);
CREATE INDEX IF NOT EXISTS idx_launch_records_update ON launch_records(update_id);
CREATE INDEX IF NOT EXISTS idx_launch_records_outcome ON launch_records(outcome);

-- Per-scope key-value data (manifest filters, server-defined headers)
CREATE TABLE IF NOT EXISTS json_data (
    scope_key TEXT NOT NULL,
    data_key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (scope_key, data_key)
);
"#;
