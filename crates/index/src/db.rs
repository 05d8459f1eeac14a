//! The SQLite file behind the index: pool, schema and metadata table.

use exn::{OptionExt, ResultExt};
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use crate::Timestamp;
use crate::error::{ErrorKind, Result};

/// Schema, applied on every connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
/// Readers (snapshot queries, resolver lookups) run side by side with the one
/// writer.
const MAX_CONNECTIONS: u32 = 5;
/// Software version recorded in, and compared against, the metadata table.
pub const INDEX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Contents of the metadata table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// When the index was created or last rebuilt (RFC 3339).
    pub created: String,
    /// Version of the software that created the index.
    pub version: String,
}
impl Metadata {
    pub fn is_current(&self) -> bool {
        self.version == INDEX_VERSION
    }
}

/// Database connection pool for the version index.
///
/// Every mutating transaction goes through [`Database::writer`], which
/// serializes writers behind one lock. Reads use the pool directly.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

/// A write transaction holding the single-writer lock until it is committed
/// or dropped. Dropping it rolls the transaction back.
pub(crate) struct Writer {
    pub(crate) tx: Transaction<'static, Sqlite>,
    _guard: OwnedMutexGuard<()>,
}
impl Writer {
    pub(crate) async fn commit(self) -> Result<()> {
        self.tx.commit().await.or_raise(|| ErrorKind::Database)
    }
}

impl Database {
    async fn new(options: SqliteConnectOptions, max: Option<u32>, created: Timestamp) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Apply the query-based PRAGMAs to every pooled connection, not
            // only the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::IndexUnavailable)?;
        let db = Self { pool, writer: Arc::new(Mutex::new(())) };
        db.migrate().await?;
        db.init_metadata(created).await?;
        Ok(db)
    }

    /// Connect to the index database at the given path.
    ///
    /// Creates the database file if it doesn't exist, runs migrations, and
    /// records `created` if the index is new.
    pub async fn connect(path: impl AsRef<Path>, created: Timestamp) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::IndexUnavailable)?;
        }
        let options = Self::base_options().filename(path).create_if_missing(true);
        tracing::debug!(path = %path.display(), "Opening index database");
        Self::new(options, None, created).await
    }

    /// Connect to an in-memory database.
    ///
    /// Not `#[cfg(test)]`, so that other crates can use it in their tests.
    pub async fn connect_in_memory(created: Timestamp) -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Every connection to ":memory:" is its own database, so the pool is
        // limited to one.
        Self::new(options, Some(1), created).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // Readers may wait on a long ingestion batch.
            .busy_timeout(std::time::Duration::from_millis(5000))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    /// PRAGMAs with no builder method on [`SqliteConnectOptions`].
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 800;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
                PRAGMA analysis_limit = 1000;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing database migrations", skip(self))]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::IndexUnavailable)
    }

    async fn init_metadata(&self, created: Timestamp) -> Result<()> {
        let created = created.to_rfc3339().ok_or_raise(|| ErrorKind::InvalidData("creation time"))?;
        let mut writer = self.writer().await?;
        for (key, value) in [("created", created.as_str()), ("version", INDEX_VERSION)] {
            sqlx::query("INSERT OR IGNORE INTO metadata (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value)
                .execute(&mut *writer.tx)
                .await
                .or_raise(|| ErrorKind::IndexUnavailable)?;
        }
        writer.commit().await
    }

    /// Record a fresh creation instant and the current software version.
    /// Used when the index is rebuilt from scratch.
    pub(crate) async fn reset_metadata(conn: &mut SqliteConnection, created: Timestamp) -> Result<()> {
        let created = created.to_rfc3339().ok_or_raise(|| ErrorKind::InvalidData("creation time"))?;
        for (key, value) in [("created", created.as_str()), ("version", INDEX_VERSION)] {
            sqlx::query("INSERT INTO metadata (key, value) VALUES (?, ?) ON CONFLICT (key) DO UPDATE SET value = excluded.value")
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        Ok(())
    }

    pub async fn metadata(&self) -> Result<Metadata> {
        let rows: Vec<(String, String)> =
            sqlx::query_as(include_str!("../queries/metadata.sql")).fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        let value = |key: &str| rows.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        Ok(Metadata {
            created: value("created").ok_or_raise(|| ErrorKind::InvalidData("created"))?,
            version: value("version").ok_or_raise(|| ErrorKind::InvalidData("version"))?,
        })
    }

    /// Begin a write transaction, waiting for any other writer to finish.
    pub(crate) async fn writer(&self) -> Result<Writer> {
        let guard = self.writer.clone().lock_owned().await;
        let tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        Ok(Writer { tx, _guard: guard })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Waits for every pooled connection to come back, then closes them.
    pub async fn close(&self) {
        // Refresh planner statistics after a large ingestion.
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}
