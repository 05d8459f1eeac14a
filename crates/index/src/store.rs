//! Version Index Store.
//!
//! All SQL touching the `versions` table lives here. Writes go through the
//! database's single writer and commit as one transaction per batch; reads
//! use the pool and may run concurrently.

use crate::Timestamp;
use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{HistoryEntry, HistoryRow, SnapshotRow, Version, VersionRow};
use async_stream::try_stream;
use exn::ResultExt;
use futures::{Stream, StreamExt, TryStreamExt};
use sqlx::SqliteConnection;
use std::collections::HashMap;

/// Which rows an [`insert`](VersionStore::insert) batch may touch.
///
/// A row that breaks the mode fails the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMode {
    pub allow_insert: bool,
    pub allow_replace: bool,
}
impl WriteMode {
    /// Every row must be new.
    pub const INSERT: Self = Self { allow_insert: true, allow_replace: false };
    /// Every row must already exist.
    pub const REPLACE: Self = Self { allow_insert: false, allow_replace: true };
    pub const UPSERT: Self = Self { allow_insert: true, allow_replace: true };
}

/// A logical path and its versions in timestamp order.
pub type Group = (String, Vec<Version>);

/// Bounds of a point-in-time lookup, already normalized.
#[derive(Debug, Default)]
pub(crate) struct SnapshotBounds<'a> {
    pub(crate) after: Option<Timestamp>,
    pub(crate) before: Option<Timestamp>,
    /// Directory prefix including its trailing `/`.
    pub(crate) prefix: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct VersionStore {
    db: Database,
}
impl From<&Database> for VersionStore {
    fn from(db: &Database) -> Self {
        Self { db: db.clone() }
    }
}
impl VersionStore {
    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Write
    // =========================================================================

    /// Write a batch of versions in one transaction.
    ///
    /// Returns the number of rows written. If any row violates `mode`, or the
    /// database rejects it, nothing from the batch is committed and
    /// [`ErrorKind::InconsistentBatch`] is returned.
    pub async fn insert(&self, versions: &[Version], mode: WriteMode) -> Result<u64> {
        if !mode.allow_insert && !mode.allow_replace {
            exn::bail!(ErrorKind::InvalidData("write mode allows neither insert nor replace"));
        }
        let rows = versions.iter().map(VersionRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut writer = self.db.writer().await?;
        for row in rows {
            Self::write_row(&mut writer.tx, row, mode).await?;
        }
        writer.commit().await.or_raise(|| ErrorKind::InconsistentBatch)?;
        tracing::debug!(rows = versions.len(), ?mode, "Committed version batch");
        Ok(versions.len() as u64)
    }

    async fn write_row(conn: &mut SqliteConnection, row: VersionRow, mode: WriteMode) -> Result<()> {
        let stored_name = row.stored_name.clone();
        if !mode.allow_insert {
            let result = sqlx::query(include_str!("../queries/replace_version.sql"))
                .bind(row.stored_name)
                .bind(row.size)
                .bind(row.mtime)
                .bind(row.checksum)
                .bind(row.is_ref)
                .bind(row.ref_target)
                .bind(row.from_destination)
                .bind(row.extra)
                .bind(row.apath)
                .bind(row.timestamp)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::InconsistentBatch)?;
            if result.rows_affected() != 1 {
                tracing::warn!(%stored_name, "Replacing a version that is not in the index; rolling back");
                exn::bail!(ErrorKind::InconsistentBatch);
            }
            return Ok(());
        }

        let sql = if mode.allow_replace {
            include_str!("../queries/upsert_version.sql")
        } else {
            include_str!("../queries/insert_version.sql")
        };
        sqlx::query(sql)
            .bind(row.stored_name)
            .bind(row.apath)
            .bind(row.timestamp)
            .bind(row.size)
            .bind(row.mtime)
            .bind(row.checksum)
            .bind(row.is_ref)
            .bind(row.ref_target)
            .bind(row.from_destination)
            .bind(row.extra)
            .execute(&mut *conn)
            .await
            .inspect_err(|err| tracing::warn!(%stored_name, error = %err, "Version rejected; rolling back"))
            .or_raise(|| ErrorKind::InconsistentBatch)?;
        Ok(())
    }

    /// Replace the whole index with `versions` in one transaction and reset
    /// the creation metadata to `created`.
    pub async fn rebuild(&self, versions: &[Version], created: Timestamp) -> Result<u64> {
        let rows = versions.iter().map(VersionRow::try_from).collect::<Result<Vec<_>>>()?;
        let mut writer = self.db.writer().await?;
        let removed = sqlx::query("DELETE FROM versions")
            .execute(&mut *writer.tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
        for row in rows {
            Self::write_row(&mut writer.tx, row, WriteMode::INSERT).await?;
        }
        Database::reset_metadata(&mut writer.tx, created).await?;
        writer.commit().await.or_raise(|| ErrorKind::InconsistentBatch)?;
        tracing::info!(removed, inserted = versions.len(), "Rebuilt version index");
        Ok(versions.len() as u64)
    }

    /// Remove rows whose objects an executor has physically deleted.
    ///
    /// Returns how many rows were removed; names not in the index are
    /// ignored.
    pub async fn acknowledge_deleted<S: AsRef<str>>(&self, stored_names: &[S]) -> Result<u64> {
        let mut writer = self.db.writer().await?;
        let mut removed = 0;
        for name in stored_names {
            removed += sqlx::query("DELETE FROM versions WHERE stored_name = ?")
                .bind(name.as_ref())
                .execute(&mut *writer.tx)
                .await
                .or_raise(|| ErrorKind::Database)?
                .rows_affected();
        }
        writer.commit().await?;
        if removed < stored_names.len() as u64 {
            tracing::warn!(requested = stored_names.len(), removed, "Some acknowledged deletions were not indexed");
        }
        Ok(removed)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// All versions of one logical path, oldest first.
    pub async fn by_apath(&self, apath: &str) -> Result<Vec<Version>> {
        let rows: Vec<VersionRow> = sqlx::query_as("SELECT * FROM versions WHERE apath = ? ORDER BY timestamp")
            .bind(apath)
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Version::try_from).collect()
    }

    /// All versions of one logical path with the number of rows referencing
    /// each of them.
    pub async fn history(&self, apath: &str) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(include_str!("../queries/history.sql"))
            .bind(apath)
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|row| -> Result<HistoryEntry> {
                let ref_count = u64::try_from(row.ref_count).or_raise(|| ErrorKind::InvalidData("ref count"))?;
                Ok(HistoryEntry { version: Version::try_from(row.version)?, ref_count: Some(ref_count) })
            })
            .collect()
    }

    pub async fn by_stored_name(&self, stored_name: &str) -> Result<Option<Version>> {
        let row: Option<VersionRow> = sqlx::query_as("SELECT * FROM versions WHERE stored_name = ? LIMIT 1")
            .bind(stored_name)
            .fetch_optional(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(Version::try_from).transpose()
    }

    /// The content row stored under `stored_name`, if there is one. Delete
    /// markers and references never qualify.
    pub async fn content_by_stored_name(&self, stored_name: &str) -> Result<Option<Version>> {
        let row: Option<VersionRow> =
            sqlx::query_as("SELECT * FROM versions WHERE stored_name = ? AND is_ref = 0 AND size >= 0 LIMIT 1")
                .bind(stored_name)
                .fetch_optional(self.db.pool())
                .await
                .or_raise(|| ErrorKind::Database)?;
        row.map(Version::try_from).transpose()
    }

    pub async fn pending_references(&self) -> Result<Vec<Version>> {
        let rows: Vec<VersionRow> = sqlx::query_as("SELECT * FROM versions WHERE is_ref = 2 ORDER BY apath, timestamp")
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Version::try_from).collect()
    }

    pub(crate) async fn pending_count_on(conn: &mut SqliteConnection) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM versions WHERE is_ref = 2")
            .fetch_one(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(u64::try_from(count).or_raise(|| ErrorKind::InvalidData("pending count"))?)
    }

    pub async fn count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM versions")
            .fetch_one(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(u64::try_from(count).or_raise(|| ErrorKind::InvalidData("row count"))?)
    }

    /// The stored name indexed under every `(apath, timestamp)` key.
    pub async fn indexed_keys(&self) -> Result<HashMap<(String, Timestamp), String>> {
        sqlx::query_as::<_, (String, i64, String)>("SELECT apath, timestamp, stored_name FROM versions")
            .fetch(self.db.pool())
            .map_ok(|(apath, timestamp, stored_name)| ((apath, Timestamp::from_unix(timestamp)), stored_name))
            .try_collect()
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Every row for which `predicate` holds, in no particular order.
    pub async fn raw_scan<F>(&self, predicate: F) -> Result<Vec<Version>>
    where
        F: Fn(&Version) -> bool,
    {
        let mut rows = sqlx::query_as::<_, VersionRow>("SELECT * FROM versions").fetch(self.db.pool());
        let mut matched = Vec::new();
        while let Some(row) = rows.try_next().await.or_raise(|| ErrorKind::Database)? {
            let version = Version::try_from(row)?;
            if predicate(&version) {
                matched.push(version);
            }
        }
        Ok(matched)
    }

    pub(crate) async fn snapshot(&self, bounds: &SnapshotBounds<'_>) -> Result<Vec<(Version, bool)>> {
        let after = bounds.after.map(Timestamp::as_unix);
        let before = bounds.before.map(Timestamp::as_unix);
        let rows: Vec<SnapshotRow> = sqlx::query_as(include_str!("../queries/snapshot.sql"))
            .bind(after)
            .bind(after)
            .bind(before)
            .bind(before)
            .bind(bounds.prefix)
            .bind(bounds.prefix)
            .bind(bounds.prefix)
            .fetch_all(self.db.pool())
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| Ok((Version::try_from(row.version)?, row.referent_present))).collect()
    }

    /// The whole index as `(apath, versions)` groups, ordered by apath
    /// case-insensitively and by timestamp within each group.
    pub fn grouped(&self) -> impl Stream<Item = Result<Group>> + Send + '_ {
        group_rows(sqlx::query_as::<_, VersionRow>(include_str!("../queries/all_grouped.sql")).fetch(self.db.pool()))
    }

    /// Like [`grouped`](Self::grouped), on a caller-held connection or
    /// transaction.
    pub(crate) fn grouped_on(conn: &mut SqliteConnection) -> impl Stream<Item = Result<Group>> + Send + '_ {
        group_rows(sqlx::query_as::<_, VersionRow>(include_str!("../queries/all_grouped.sql")).fetch(conn))
    }
}

fn group_rows<'a, S>(rows: S) -> impl Stream<Item = Result<Group>> + Send + 'a
where
    S: Stream<Item = sqlx::Result<VersionRow>> + Send + 'a,
{
    try_stream! {
        let mut rows = rows.boxed();
        let mut current: Option<Group> = None;
        while let Some(row) = rows.try_next().await.or_raise(|| ErrorKind::Database)? {
            let version = Version::try_from(row)?;
            if let Some((apath, versions)) = current.as_mut()
                && *apath == version.apath
            {
                versions.push(version);
                continue;
            }
            if let Some(done) = current.replace((version.apath.clone(), vec![version])) {
                yield done;
            }
        }
        if let Some(done) = current {
            yield done;
        }
    }
}
