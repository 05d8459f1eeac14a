//! Snapshot Query Engine.

use crate::Timestamp;
use crate::error::{ErrorKind, Result};
use crate::models::{HistoryEntry, Version};
use crate::store::{SnapshotBounds, VersionStore};

/// Point-in-time (or time range) reconstruction request.
///
/// # Examples
///
/// ```
/// use tempo_index::{SnapshotQuery, Timestamp};
///
/// let query = SnapshotQuery::new().prefix("photos/2023").before(Timestamp::from_unix(1_704_067_200));
/// assert!(query.remove_delete);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotQuery {
    /// Only paths below this directory.
    pub prefix: Option<String>,
    /// Inclusive upper bound.
    pub before: Option<Timestamp>,
    /// Inclusive lower bound.
    pub after: Option<Timestamp>,
    /// Leave out paths whose selected version is a deletion.
    pub remove_delete: bool,
}
impl Default for SnapshotQuery {
    fn default() -> Self {
        Self { prefix: None, before: None, after: None, remove_delete: true }
    }
}
impl SnapshotQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn before(mut self, before: Timestamp) -> Self {
        self.before = Some(before);
        self
    }

    pub fn after(mut self, after: Timestamp) -> Self {
        self.after = Some(after);
        self
    }

    /// Return delete markers and broken references instead of hiding them.
    pub fn keep_deletes(mut self) -> Self {
        self.remove_delete = false;
        self
    }
}

/// `./photos/2023/` and `photos/2023` both become `photos/2023/`. An empty
/// prefix (or `.`) means the whole tree.
pub(crate) fn normalize_prefix(prefix: &str) -> Option<String> {
    let mut trimmed = prefix.trim_end_matches('/');
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    match trimmed {
        "" | "." => None,
        dir => Some(format!("{dir}/")),
    }
}

/// The latest version of every path within the query's bounds, ordered
/// case-insensitively by path.
///
/// # Errors
///
/// [`ErrorKind::MissingReferent`] if a selected reference borrows bytes from
/// a row that is no longer indexed.
pub async fn snapshot(store: &VersionStore, query: &SnapshotQuery) -> Result<Vec<Version>> {
    let prefix = query.prefix.as_deref().and_then(normalize_prefix);
    let bounds = SnapshotBounds { after: query.after, before: query.before, prefix: prefix.as_deref() };
    let mut versions = Vec::new();
    for (version, referent_present) in store.snapshot(&bounds).await? {
        if !referent_present {
            tracing::error!(stored_name = %version.stored_name, target = ?version.lifecycle.target(), "Referent missing from index");
            exn::bail!(ErrorKind::MissingReferent(version.stored_name));
        }
        if query.remove_delete && version.lifecycle.is_deletion() {
            continue;
        }
        versions.push(version);
    }
    tracing::debug!(prefix = ?prefix, returned = versions.len(), "Reconstructed snapshot");
    Ok(versions)
}

/// Every version of `apath`, oldest first.
pub async fn history(store: &VersionStore, apath: &str, with_ref_counts: bool) -> Result<Vec<HistoryEntry>> {
    let apath = apath.strip_prefix("./").unwrap_or(apath);
    if with_ref_counts {
        return store.history(apath).await;
    }
    Ok(store.by_apath(apath).await?.into_iter().map(|version| HistoryEntry { version, ref_count: None }).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::Lifecycle;
    use crate::store::WriteMode;
    use rstest::rstest;
    use tempo_storage::Hashes;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::from_unix(secs)
    }

    fn content(apath: &str, secs: i64) -> Version {
        Version::new(apath, ts(secs), Lifecycle::Content { size: 4, mtime: None, checksum: Hashes::new() })
    }

    fn reference(apath: &str, secs: i64, target: &Version) -> Version {
        let lifecycle = Lifecycle::ReferenceResolved {
            target: target.stored_name.clone(),
            size: 4,
            mtime: None,
            checksum: Hashes::new(),
        };
        Version::new(apath, ts(secs), lifecycle)
    }

    async fn store_with(versions: &[Version]) -> VersionStore {
        let db = Database::connect_in_memory(ts(0)).await.unwrap();
        let store = VersionStore::from(&db);
        store.insert(versions, WriteMode::INSERT).await.unwrap();
        store
    }

    fn names(versions: &[Version]) -> Vec<&str> {
        versions.iter().map(|v| v.stored_name.as_str()).collect()
    }

    #[rstest]
    #[case("sub", Some("sub/"))]
    #[case("sub/", Some("sub/"))]
    #[case("./sub/dir//", Some("sub/dir/"))]
    #[case("", None)]
    #[case(".", None)]
    #[case("./", None)]
    fn test_normalize_prefix(#[case] prefix: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize_prefix(prefix).as_deref(), expected);
    }

    #[tokio::test]
    async fn test_snapshot_bounds_and_deletes() {
        let store = store_with(&[
            content("a.txt", 1),
            Version::new("a.txt", ts(3), Lifecycle::Delete),
            content("b.txt", 2),
            content("b.txt", 5),
            content("C.txt", 4),
        ])
        .await;

        let latest = snapshot(&store, &SnapshotQuery::new()).await.unwrap();
        assert_eq!(names(&latest), vec!["b.19700101000005.txt", "C.19700101000004.txt"]);

        let at_two = snapshot(&store, &SnapshotQuery::new().before(ts(2))).await.unwrap();
        assert_eq!(names(&at_two), vec!["a.19700101000001.txt", "b.19700101000002.txt"]);

        let with_deletes = snapshot(&store, &SnapshotQuery::new().before(ts(3)).keep_deletes()).await.unwrap();
        assert_eq!(names(&with_deletes), vec!["a.19700101000003D.txt", "b.19700101000002.txt"]);

        let window = snapshot(&store, &SnapshotQuery::new().after(ts(4)).before(ts(5))).await.unwrap();
        assert_eq!(names(&window), vec!["b.19700101000005.txt", "C.19700101000004.txt"]);
    }

    #[tokio::test]
    async fn test_snapshot_prefix_is_a_directory() {
        let store = store_with(&[content("sub/a.txt", 1), content("subdir/b.txt", 1), content("sub/deep/c.txt", 1)]).await;
        let found = snapshot(&store, &SnapshotQuery::new().prefix("./sub/")).await.unwrap();
        assert_eq!(names(&found), vec!["sub/a.19700101000001.txt", "sub/deep/c.19700101000001.txt"]);
    }

    #[tokio::test]
    async fn test_snapshot_missing_referent_is_an_error() {
        let original = content("b.txt", 1);
        let moved = reference("c.txt", 3, &original);
        let store = store_with(&[original.clone(), moved.clone()]).await;
        assert_eq!(snapshot(&store, &SnapshotQuery::new()).await.unwrap().len(), 2);

        store.acknowledge_deleted(&[original.stored_name.as_str()]).await.unwrap();
        let err = snapshot(&store, &SnapshotQuery::new()).await.unwrap_err();
        assert_eq!(&*err, &ErrorKind::MissingReferent(moved.stored_name.clone()));
    }

    #[tokio::test]
    async fn test_history_with_ref_counts() {
        let store = store_with(&[
            content("a.txt", 1),
            content("a.txt", 3),
            content("a.txt", 5),
            Version::new("a.txt", ts(7), Lifecycle::Delete),
            reference("x.txt", 8, &content("a.txt", 3)),
            reference("y.txt", 9, &content("a.txt", 3)),
        ])
        .await;

        let plain = history(&store, "a.txt", false).await.unwrap();
        let timestamps: Vec<_> = plain.iter().map(|entry| entry.version.timestamp.as_unix()).collect();
        assert_eq!(timestamps, vec![1, 3, 5, 7]);
        assert!(plain.iter().all(|entry| entry.ref_count.is_none()));
        assert_eq!(plain[3].version.size(), -1);

        let counted = history(&store, "./a.txt", true).await.unwrap();
        let counts: Vec<_> = counted.iter().map(|entry| entry.ref_count).collect();
        assert_eq!(counts, vec![Some(0), Some(2), Some(0), Some(0)]);
    }
}
