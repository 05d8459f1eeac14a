//! Version index and retention planner for a time-versioned backup
//! destination.
//!
//! Every backed-up file lives at the destination as immutable objects whose
//! names carry the logical path, a timestamp and a lifecycle flag (see
//! [`codec`]). This crate keeps a SQLite index of every such object, rebuilds
//! the logical tree as it was at any instant, and plans which historical
//! objects can be destroyed for a retention policy.
//!
//! The index is not the source of truth: the destination listing is. If the
//! database is lost or was written by another version of this crate, it is
//! rebuilt from a fresh listing.
//!
//! # Architecture
//! - [`codec`]: stored name ⇄ (logical path, timestamp, flag)
//! - [`VersionStore`]: the `versions` table, one writer, many readers
//! - [`ingest`]: destination listing → rows
//! - [`resolve`]: pending dedup references → resolved or broken rows
//! - [`query`]: snapshots and per-path history
//! - [`retention`]: deletion plans
//!
//! [`Index`] ties them together for one destination.

pub mod codec;
mod db;
pub mod error;
pub mod ingest;
mod models;
pub mod query;
pub mod resolve;
pub mod retention;
mod store;
mod timestamp;

pub use crate::db::{Database, INDEX_VERSION, Metadata};
pub use crate::ingest::{IngestOptions, IngestReport};
pub use crate::models::{HistoryEntry, Lifecycle, NO_SIZE, Version};
pub use crate::query::SnapshotQuery;
pub use crate::resolve::ResolveReport;
pub use crate::retention::{RetentionPlan, RetentionPolicy};
pub use crate::store::{Group, VersionStore, WriteMode};
pub use crate::timestamp::Timestamp;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::Path;
use tempo_config::Config;
use tempo_storage::BackendHandle;

/// Default number of reference markers read at once.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Everything an [`Index`] needs besides its database and backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOptions {
    /// Concurrent remote reads while resolving references.
    pub concurrency: usize,
    pub ingest: IngestOptions,
    /// The instant relative policies and new metadata are measured from.
    pub now: Timestamp,
}
impl IndexOptions {
    pub fn new(now: Timestamp) -> Self {
        Self { concurrency: DEFAULT_CONCURRENCY, ingest: IngestOptions::default(), now }
    }

    pub fn from_config(config: &Config, now: Timestamp) -> Self {
        Self { concurrency: config.index.concurrency.max(1), ingest: IngestOptions::from(&config.ingest), now }
    }
}

/// Outcome of listing a destination into the index.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub ingest: IngestReport,
    /// Rows written by this run.
    pub inserted: u64,
    /// Listed objects that were already indexed.
    pub already_indexed: u64,
    pub resolve: ResolveReport,
}

/// The version index of one destination.
pub struct Index {
    store: VersionStore,
    backend: BackendHandle,
    options: IndexOptions,
}

impl Index {
    /// Open (or create) the index database at `path`.
    ///
    /// An index written by a different software version is rebuilt from the
    /// destination listing before it is returned.
    pub async fn connect(path: impl AsRef<Path>, backend: BackendHandle, options: IndexOptions) -> Result<Self> {
        let db = Database::connect(path, options.now).await?;
        Self::from_database(db, backend, options).await
    }

    /// Open the index at the location `config` names.
    pub async fn open(config: &Config, backend: BackendHandle, now: Timestamp) -> Result<Self> {
        let path = config.database_path().or_raise(|| ErrorKind::IndexUnavailable)?;
        Self::connect(path, backend, IndexOptions::from_config(config, now)).await
    }

    /// An index that lives only as long as this value.
    pub async fn in_memory(backend: BackendHandle, options: IndexOptions) -> Result<Self> {
        let db = Database::connect_in_memory(options.now).await?;
        Self::from_database(db, backend, options).await
    }

    async fn from_database(db: Database, backend: BackendHandle, options: IndexOptions) -> Result<Self> {
        let index = Self { store: VersionStore::from(&db), backend, options };
        let metadata = db.metadata().await?;
        if !metadata.is_current() {
            tracing::warn!(found = %metadata.version, expected = INDEX_VERSION, "Index written by another version; rebuilding");
            index.rebuild().await?;
        }
        Ok(index)
    }

    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    pub async fn metadata(&self) -> Result<Metadata> {
        self.store.database().metadata().await
    }

    /// List the destination (optionally below `prefix`), add every object
    /// not yet indexed, then resolve the references this added.
    ///
    /// An object whose path and timestamp are already indexed under another
    /// spelling of its name is skipped, the same as a duplicate within one
    /// listing.
    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn ingest_run(&self, prefix: Option<&Path>) -> Result<RunReport> {
        let known = self.store.indexed_keys().await?;
        let mut ingested = ingest::ingest(self.backend.list_stream(prefix), &self.options.ingest).await?;
        let mut new = Vec::new();
        let mut already_indexed = 0;
        for version in ingested.versions {
            match known.get(&(version.apath.clone(), version.timestamp)) {
                None => new.push(version),
                Some(indexed) if *indexed == version.stored_name => already_indexed += 1,
                Some(indexed) => {
                    tracing::warn!(stored_name = %version.stored_name, %indexed, "Path and timestamp already indexed under another name; skipping");
                    ingested.report.indexed -= 1;
                    ingested.report.skipped += 1;
                },
            }
        }
        let inserted = if new.is_empty() { 0 } else { self.store.insert(&new, WriteMode::INSERT).await? };
        let resolve = self.resolve_references().await?;
        Ok(RunReport { ingest: ingested.report, inserted, already_indexed, resolve })
    }

    /// Throw the index away and rebuild it from a full destination listing.
    #[tracing::instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn rebuild(&self) -> Result<RunReport> {
        let ingested = ingest::ingest(self.backend.list_stream(None), &self.options.ingest).await?;
        let inserted = self.store.rebuild(&ingested.versions, self.options.now).await?;
        let resolve = self.resolve_references().await?;
        Ok(RunReport { ingest: ingested.report, inserted, already_indexed: 0, resolve })
    }

    pub async fn resolve_references(&self) -> Result<ResolveReport> {
        resolve::resolve_references(&self.store, self.backend.as_ref(), self.options.concurrency).await
    }

    pub async fn snapshot(&self, query: &SnapshotQuery) -> Result<Vec<Version>> {
        query::snapshot(&self.store, query).await
    }

    pub async fn history(&self, apath: &str, with_ref_counts: bool) -> Result<Vec<HistoryEntry>> {
        query::history(&self.store, apath, with_ref_counts).await
    }

    /// Plan deletions for `policy`, measured from the configured `now`.
    pub async fn plan_retention(&self, policy: &RetentionPolicy, prefix: Option<&str>) -> Result<RetentionPlan> {
        let cutoff = policy.cutoff(self.options.now)?;
        retention::plan_retention(&self.store, cutoff, prefix).await
    }

    /// Record that an executor physically deleted these objects.
    pub async fn acknowledge_deleted<S: AsRef<str>>(&self, stored_names: &[S]) -> Result<u64> {
        self.store.acknowledge_deleted(stored_names).await
    }

    pub async fn close(&self) {
        self.store.database().close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempo_storage::backend::{MockBackend, ReadOnlyBackend, StorageBackend};

    fn backend() -> BackendHandle {
        Arc::new(MockBackend::with_files([
            ("a.19700101000001.txt", Vec::from(*b"1234")),
            ("a.19700101000003D.txt", Vec::new()),
        ]))
    }

    #[tokio::test]
    async fn test_ingest_run_is_incremental() {
        let backend = backend();
        let index = Index::in_memory(backend.clone(), IndexOptions::new(Timestamp::from_unix(10))).await.unwrap();
        let first = index.ingest_run(None).await.unwrap();
        assert_eq!((first.inserted, first.already_indexed), (2, 0));

        backend.write(Path::new("b.19700101000005.txt"), b"new").await.unwrap();
        let second = index.ingest_run(None).await.unwrap();
        assert_eq!((second.inserted, second.already_indexed), (1, 2));
        assert_eq!(index.store().count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_second_spelling_of_an_indexed_instant_is_skipped() {
        let backend = backend();
        let index = Index::in_memory(backend.clone(), IndexOptions::new(Timestamp::from_unix(10))).await.unwrap();
        index.ingest_run(None).await.unwrap();

        backend.write(Path::new("a.1970-01-01T00:00:01.txt"), b"1234").await.unwrap();
        backend.write(Path::new("b.19700101000005.txt"), b"new").await.unwrap();
        // The dashed spelling lists first, so the canonical object is the
        // in-listing duplicate and the dashed one collides with the index.
        for expected in [(1, 1), (0, 2)] {
            let run = index.ingest_run(None).await.unwrap();
            assert_eq!(run.ingest, IngestReport { listed: 4, indexed: 2, skipped: 2 });
            assert_eq!((run.inserted, run.already_indexed), expected);
            assert_eq!(index.history("b.txt", false).await.unwrap().len(), 1);
        }
        let a = index.store().by_apath("a.txt").await.unwrap();
        assert_eq!(a[0].stored_name, "a.19700101000001.txt");
        assert_eq!(index.store().count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_index_is_rebuilt_on_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.db");
        let db = Database::connect(&path, Timestamp::from_unix(1)).await.unwrap();
        sqlx::query("UPDATE metadata SET value = '0.0.0' WHERE key = 'version'").execute(db.pool()).await.unwrap();
        db.close().await;

        let index = Index::connect(&path, backend(), IndexOptions::new(Timestamp::from_unix(60))).await.unwrap();
        let metadata = index.metadata().await.unwrap();
        assert!(metadata.is_current());
        assert_eq!(metadata.created, "1970-01-01T00:01:00Z");
        assert_eq!(index.store().count().await.unwrap(), 2);
        index.close().await;
    }

    #[tokio::test]
    async fn test_open_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.index.database = Some(dir.path().join("from-config.db"));
        config.index.concurrency = 2;
        let index = Index::open(&config, backend(), Timestamp::from_unix(10)).await.unwrap();
        assert_eq!(index.options().concurrency, 2);
        assert!(dir.path().join("from-config.db").exists());
        index.close().await;
    }

    async fn indexed(files: Vec<(&'static str, Vec<u8>)>, now: i64) -> (Arc<MockBackend>, Index) {
        let backend = Arc::new(MockBackend::with_files(files));
        let index = Index::in_memory(backend.clone(), IndexOptions::new(Timestamp::from_unix(now))).await.unwrap();
        index.ingest_run(None).await.unwrap();
        (backend, index)
    }

    fn before(secs: i64) -> RetentionPolicy {
        RetentionPolicy::Before(Timestamp::from_unix(secs))
    }

    #[tokio::test]
    async fn test_content_then_delete() {
        let (_, index) = indexed(
            vec![("a.19700101000001.txt", b"1234".to_vec()), ("a.19700101000003D.txt", Vec::new())],
            10,
        )
        .await;
        assert!(index.plan_retention(&before(2), None).await.unwrap().is_empty());
        let plan = index.plan_retention(&before(4), None).await.unwrap();
        assert_eq!(plan.entries().collect::<Vec<_>>(), vec![("a.19700101000001.txt", 4)]);
        assert_eq!(plan.reclaimable_bytes(), 4);
    }

    #[tokio::test]
    async fn test_renamed_file_keeps_its_bytes() {
        let (_, index) = indexed(
            vec![
                ("b.19700101000001.txt", b"data".to_vec()),
                ("b.19700101000003D.txt", Vec::new()),
                ("c.19700101000003R.txt", b"b.19700101000001.txt".to_vec()),
            ],
            100,
        )
        .await;
        for cutoff in [2, 4, 50, 100] {
            let plan = index.plan_retention(&before(cutoff), None).await.unwrap();
            assert!(!plan.contains("b.19700101000001.txt"), "cutoff {cutoff}");
        }
        let restored = index.snapshot(&SnapshotQuery::new()).await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].apath, "c.txt");
        assert_eq!(restored[0].lifecycle.target(), Some("b.19700101000001.txt"));
        assert_eq!(restored[0].size(), 4);
    }

    #[tokio::test]
    async fn test_history_ends_with_delete() {
        let (_, index) = indexed(
            vec![
                ("a.19700101000001.txt", b"1".to_vec()),
                ("a.19700101000003.txt", b"33".to_vec()),
                ("a.19700101000005.txt", b"555".to_vec()),
                ("a.19700101000007D.txt", Vec::new()),
            ],
            10,
        )
        .await;
        let history = index.history("a.txt", false).await.unwrap();
        let sizes: Vec<_> = history.iter().map(|entry| (entry.version.timestamp.as_unix(), entry.version.size())).collect();
        assert_eq!(sizes, vec![(1, 1), (3, 2), (5, 3), (7, -1)]);
        assert_eq!(history[3].version.lifecycle, Lifecycle::Delete);
    }

    #[tokio::test]
    async fn test_plan_below_prefix() {
        let (_, index) = indexed(
            vec![
                ("sub/x.19700101000001.txt", b"x".to_vec()),
                ("sub/x.19700101000002.txt", b"xx".to_vec()),
                ("top.19700101000001.txt", b"t".to_vec()),
                ("top.19700101000002.txt", b"tt".to_vec()),
            ],
            10,
        )
        .await;
        let plan = index.plan_retention(&before(10), Some("./sub/")).await.unwrap();
        assert_eq!(plan.stored_names(), vec!["sub/x.19700101000001.txt".to_string()]);
        assert_eq!(index.plan_retention(&before(10), None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unresolved_references_refuse_planning() {
        let (_, index) = indexed(vec![("a.19700101000001.txt", b"a".to_vec())], 10).await;
        let pending = Version::new("p.txt", Timestamp::from_unix(2), Lifecycle::ReferencePending);
        index.store().insert(&[pending], WriteMode::INSERT).await.unwrap();
        let err = index.plan_retention(&before(10), None).await.unwrap_err();
        assert_eq!(&*err, &error::ErrorKind::PendingReferences(1));
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let (_, index) = indexed(
            vec![
                ("a.19700101000001.txt", b"1234".to_vec()),
                ("README", b"not ours".to_vec()),
                ("c.19700101000003R.txt", b"missing.19700101000001.txt".to_vec()),
            ],
            10,
        )
        .await;
        let first = index.rebuild().await.unwrap();
        let snapshot = index.snapshot(&SnapshotQuery::new().keep_deletes()).await.unwrap();
        let second = index.rebuild().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.ingest.skipped, 1);
        assert_eq!(first.resolve, ResolveReport { resolved: 0, broken: 1 });
        assert_eq!(index.snapshot(&SnapshotQuery::new().keep_deletes()).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_executing_a_plan() {
        let dir = tempfile::tempdir().unwrap();
        let local = tempo_storage::backend::LocalBackend::new("local", dir.path()).unwrap();
        for (name, data) in [
            ("docs/a.19700101000001.txt", &b"old!"[..]),
            ("docs/a.19700101000005.txt", &b"new"[..]),
            ("docs/b.19700101000002.txt", &b"keep"[..]),
        ] {
            local.write(Path::new(name), data).await.unwrap();
        }
        let backend: BackendHandle = Arc::new(local);
        let index = Index::in_memory(backend.clone(), IndexOptions::new(Timestamp::from_unix(10))).await.unwrap();
        assert_eq!(index.ingest_run(Some(Path::new("docs"))).await.unwrap().inserted, 3);
        let plan = index.plan_retention(&before(10), None).await.unwrap();
        assert_eq!(plan.stored_names(), vec!["docs/a.19700101000001.txt".to_string()]);

        // A dry run leaves the destination alone.
        let dry_run = ReadOnlyBackend::new(backend.clone());
        for name in plan.stored_names() {
            dry_run.delete(Path::new(&name)).await.unwrap();
        }
        assert!(backend.exists(Path::new("docs/a.19700101000001.txt")).await.unwrap());

        for name in plan.stored_names() {
            backend.delete(Path::new(&name)).await.unwrap();
        }
        assert_eq!(index.acknowledge_deleted(&plan.stored_names()).await.unwrap(), 1);
        assert_eq!(index.history("docs/a.txt", false).await.unwrap().len(), 1);
        assert!(index.plan_retention(&before(10), None).await.unwrap().is_empty());
        let again = index.ingest_run(None).await.unwrap();
        assert_eq!((again.inserted, again.already_indexed), (0, 2));
    }

    #[tokio::test]
    async fn test_plan_uses_configured_now() {
        let index = Index::in_memory(backend(), IndexOptions::new(Timestamp::from_unix(10))).await.unwrap();
        index.ingest_run(None).await.unwrap();
        let keep_everything = RetentionPolicy::KeepFor(std::time::Duration::from_secs(8));
        assert!(index.plan_retention(&keep_everything, None).await.unwrap().is_empty());
        let keep_little = RetentionPolicy::KeepFor(std::time::Duration::from_secs(5));
        let plan = index.plan_retention(&keep_little, None).await.unwrap();
        assert_eq!(plan.stored_names(), vec!["a.19700101000001.txt".to_string()]);
    }
}
