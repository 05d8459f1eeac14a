//! Listing Ingestion.
//!
//! Turns a destination listing into index rows. Objects whose names carry no
//! timestamp are not ours (or are damaged) and are skipped with a warning,
//! never failing the run.

use crate::codec::{self, Flag};
use crate::error::{ErrorKind, Result};
use crate::models::{Lifecycle, Version};
use crate::timestamp::Timestamp;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use std::collections::HashSet;
use std::pin::pin;
use std::time::{Duration, Instant};
use tempo_config::IngestConfig;
use tempo_storage::RemoteEntry;
use tempo_storage::error::Result as StorageResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOptions {
    /// Log progress this often while the listing is consumed.
    pub progress_interval: Option<Duration>,
    /// Provider attributes that never reach a version's attribute bag.
    pub ignored_metadata: HashSet<String>,
    /// Keep only this checksum type. All reported checksums when unset.
    pub hash_type: Option<String>,
}
impl Default for IngestOptions {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}
impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            progress_interval: config.progress_interval_secs.map(Duration::from_secs),
            ignored_metadata: config.ignored_metadata.iter().cloned().collect(),
            hash_type: config.hash_type.clone(),
        }
    }
}

/// Counts for one pass over a listing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub listed: u64,
    pub indexed: u64,
    /// Malformed names and repeated (apath, timestamp) pairs.
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct Ingested {
    pub versions: Vec<Version>,
    pub report: IngestReport,
}

/// Classify one listed object.
///
/// # Errors
///
/// [`ErrorKind::MalformedName`] if the path is not UTF-8 or carries no
/// timestamp.
pub fn classify(entry: &RemoteEntry, options: &IngestOptions) -> Result<Version> {
    let stored_name = entry
        .key()
        .ok_or_else(|| exn::Exn::from(ErrorKind::MalformedName(entry.path.to_string_lossy().into_owned())))?;
    let decoded = codec::decode(&stored_name)?;
    let lifecycle = match decoded.flag {
        // Markers own no bytes, whatever size the provider reports.
        Flag::Delete => Lifecycle::Delete,
        Flag::Reference => Lifecycle::ReferencePending,
        Flag::Content => {
            let checksum = entry
                .hashes
                .iter()
                .filter(|(kind, _)| options.hash_type.as_ref().is_none_or(|wanted| wanted == *kind))
                .map(|(kind, digest)| (kind.clone(), digest.clone()))
                .collect();
            Lifecycle::Content { size: entry.size, mtime: entry.mtime(), checksum }
        },
    };
    let extra = entry
        .extra
        .iter()
        .filter(|(key, _)| !options.ignored_metadata.contains(key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(Version {
        stored_name,
        apath: decoded.apath,
        timestamp: decoded.timestamp,
        lifecycle,
        from_destination: true,
        extra,
    })
}

/// Consume a listing and classify every object in it.
///
/// A failing listing aborts with [`ErrorKind::Listing`]; per-object problems
/// are counted in [`IngestReport::skipped`].
pub async fn ingest<S>(listing: S, options: &IngestOptions) -> Result<Ingested>
where
    S: Stream<Item = StorageResult<RemoteEntry>>,
{
    let mut listing = pin!(listing);
    let started = Instant::now();
    let mut last_progress = started;
    let mut report = IngestReport::default();
    let mut seen: HashSet<(String, Timestamp)> = HashSet::new();
    let mut versions = Vec::new();

    while let Some(entry) = listing.try_next().await.or_raise(|| ErrorKind::Listing)? {
        report.listed += 1;
        match classify(&entry, options) {
            Ok(version) if !seen.insert((version.apath.clone(), version.timestamp)) => {
                report.skipped += 1;
                tracing::warn!(stored_name = %version.stored_name, "Another object already holds this path and timestamp; skipping");
            },
            Ok(version) => {
                report.indexed += 1;
                versions.push(version);
            },
            Err(err) if matches!(&*err, ErrorKind::MalformedName(_)) => {
                report.skipped += 1;
                tracing::warn!(path = %entry.path.display(), "No timestamp in object name; skipping");
            },
            Err(err) => return Err(err),
        }

        if let Some(interval) = options.progress_interval
            && last_progress.elapsed() >= interval
        {
            tracing::info!(listed = report.listed, elapsed_secs = started.elapsed().as_secs(), "Listing destination");
            last_progress = Instant::now();
        }
    }

    tracing::info!(
        listed = report.listed,
        indexed = report.indexed,
        skipped = report.skipped,
        "Ingested destination listing"
    );
    Ok(Ingested { versions, report })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempo_storage::backend::{MockBackend, StorageBackend};
    use tempo_storage::error::ErrorKind as StorageErrorKind;

    #[test]
    fn test_classify_content_keeps_metadata() {
        let entry = RemoteEntry::new("docs/a.20240101000000.txt", 12, None)
            .with_hash("blake3", "abc")
            .with_extra("Tier", "COLD")
            .with_extra("StorageClass", "STANDARD");
        let version = classify(&entry, &IngestOptions::default()).unwrap();
        assert_eq!(version.apath, "docs/a.txt");
        assert_eq!(version.timestamp, Timestamp::from_unix(1_704_067_200));
        assert_eq!(version.size(), 12);
        assert_eq!(version.checksum().and_then(|c| c.get("blake3")).map(String::as_str), Some("abc"));
        assert!(version.from_destination);
        // "Tier" is on the default ignore-list.
        assert_eq!(version.extra.len(), 1);
        assert_eq!(version.extra.get("StorageClass"), Some(&Value::from("STANDARD")));
    }

    #[test]
    fn test_classify_keeps_configured_hash_type() {
        let entry = RemoteEntry::new("a.20240101000000.txt", 1, None).with_hash("md5", "m").with_hash("blake3", "b");
        let options = IngestOptions { hash_type: Some("blake3".to_string()), ..IngestOptions::default() };
        let version = classify(&entry, &options).unwrap();
        assert_eq!(version.checksum().map(|c| c.keys().cloned().collect::<Vec<_>>()), Some(vec!["blake3".to_string()]));
        assert_eq!(classify(&entry, &IngestOptions::default()).unwrap().checksum().map(|c| c.len()), Some(2));
    }

    #[test]
    fn test_classify_markers() {
        let options = IngestOptions::default();
        let delete = classify(&RemoteEntry::new("a.20240101000000D.txt", 99, None), &options).unwrap();
        assert_eq!(delete.lifecycle, Lifecycle::Delete);
        assert_eq!(delete.size(), -1);

        let reference = classify(&RemoteEntry::new("a.20240102000000R.txt", 30, None), &options).unwrap();
        assert_eq!(reference.lifecycle, Lifecycle::ReferencePending);
        assert_eq!(reference.stored_name, "a.20240102000000R.txt");
    }

    #[test]
    fn test_classify_keeps_listed_name() {
        let entry = RemoteEntry::new("a.2024-01-01T00:00:00Z.txt", 1, None);
        let version = classify(&entry, &IngestOptions::default()).unwrap();
        assert_eq!(version.stored_name, "a.2024-01-01T00:00:00Z.txt");
        assert_eq!(version.apath, "a.txt");
    }

    #[tokio::test]
    async fn test_ingest_counts_skipped_rows() {
        let backend = MockBackend::with_files([
            ("a.19700101000001.txt", Vec::from(*b"1234")),
            ("a.19700101000003D.txt", Vec::new()),
            ("README", Vec::from(*b"not a version")),
            ("notes.txt", Vec::from(*b"neither")),
            ("b.19700101000001.txt", Vec::from(*b"x")),
            ("b.19700101000001R.txt", Vec::from(*b"a.19700101000001.txt")),
        ]);
        let ingested = ingest(backend.list_stream(None), &IngestOptions::default()).await.unwrap();
        assert_eq!(ingested.report, IngestReport { listed: 6, indexed: 3, skipped: 3 });
        let names: Vec<_> = ingested.versions.iter().map(|v| v.stored_name.as_str()).collect();
        assert_eq!(names, vec!["a.19700101000001.txt", "a.19700101000003D.txt", "b.19700101000001.txt"]);
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let listing = futures::stream::iter(vec![
            Ok(RemoteEntry::new("a.19700101000001.txt", 1, None)),
            Err(exn::Exn::from(StorageErrorKind::BackendError("connection reset".to_string()))),
        ]);
        let err = ingest(listing, &IngestOptions::default()).await.unwrap_err();
        assert_eq!(&*err, &ErrorKind::Listing);
    }

    #[test]
    fn test_options_from_config() {
        let config = IngestConfig {
            progress_interval_secs: None,
            ignored_metadata: vec!["ID".to_string()],
            hash_type: Some("md5".to_string()),
        };
        let options = IngestOptions::from(&config);
        assert_eq!(options.progress_interval, None);
        assert_eq!(options.hash_type.as_deref(), Some("md5"));
        assert!(options.ignored_metadata.contains("ID"));
    }
}
