//! In-memory destination for tests.

use super::RemoteEntryStream;
use crate::error::{Error, ErrorKind, Result};
use crate::path::validate as validate_path;
use crate::{Hashes, RemoteEntry, StorageBackend};
use async_stream::stream;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MockObject {
    data: Vec<u8>,
    modified: OffsetDateTime,
    hashes: Hashes,
    extra: Map<String, Value>,
}
impl MockObject {
    fn new(data: Vec<u8>) -> Self {
        Self { data, modified: OffsetDateTime::now_utc(), hashes: Hashes::new(), extra: Map::new() }
    }

    fn entry(&self, path: &Path) -> RemoteEntry {
        RemoteEntry {
            path: path.to_path_buf(),
            size: self.data.len() as u64,
            modified: Some(self.modified),
            hashes: self.hashes.clone(),
            extra: self.extra.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    unreadable: HashSet<PathBuf>,
    listing_fails_after: Option<usize>,
    read_delay: Option<Duration>,
}

/// In-memory destination for tests.
///
/// Listings come back in path order. Objects can carry provider attributes
/// and checksums, reads or listings can be made to fail, and reads can be
/// slowed down to observe how many run at once.
///
/// # Examples
///
/// ```
/// use tempo_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("docs/a.20240101000000.txt", b"data"),
/// ]);
/// assert!(backend.exists(Path::new("docs/a.20240101000000.txt")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    objects: RwLock<BTreeMap<PathBuf, MockObject>>,
    faults: Mutex<Faults>,
    reads_in_flight: AtomicUsize,
    peak_reads: AtomicUsize,
}

impl MockBackend {
    /// Panics on a path that does not validate: a broken fixture should not
    /// produce a passing test.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let objects = files
            .into_iter()
            .map(|(path, data)| {
                let path = path.into();
                match validate_path(&path) {
                    Ok(valid) => (valid, MockObject::new(data.into())),
                    Err(_) => panic!("MockBackend::with_files: invalid path {}", path.display()),
                }
            })
            .collect();
        Self {
            name: "mock".to_string(),
            objects: RwLock::new(objects),
            faults: Mutex::new(Faults::default()),
            reads_in_flight: AtomicUsize::new(0),
            peak_reads: AtomicUsize::new(0),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a provider attribute to an existing object.
    pub fn set_extra(&mut self, path: impl AsRef<Path>, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(object) = self.objects.get_mut().get_mut(path.as_ref()) {
            object.extra.insert(key.into(), value.into());
        }
    }

    /// Attach a checksum to an existing object.
    pub fn set_hash(&mut self, path: impl AsRef<Path>, kind: impl Into<String>, digest: impl Into<String>) {
        if let Some(object) = self.objects.get_mut().get_mut(path.as_ref()) {
            object.hashes.insert(kind.into(), digest.into());
        }
    }

    /// Reads of `path` fail with a backend error; it is still listed.
    pub fn fail_reads_of(&self, path: impl AsRef<Path>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unreadable.insert(path.as_ref().to_path_buf());
        }
    }

    /// Listings yield `count` objects and then an error.
    pub fn fail_listing_after(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.listing_fails_after = Some(count);
        }
    }

    /// Every read sleeps for `delay` before answering.
    pub fn delay_reads(&self, delay: Duration) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.read_delay = Some(delay);
        }
    }

    /// Most reads that were in progress at the same time so far.
    pub fn peak_concurrent_reads(&self) -> usize {
        self.peak_reads.load(Ordering::SeqCst)
    }

    async fn read_object(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        if let Some(delay) = self.faults(|faults| faults.read_delay).flatten() {
            tokio::time::sleep(delay).await;
        }
        if self.faults(|faults| faults.unreadable.contains(&path)).unwrap_or(false) {
            exn::bail!(ErrorKind::BackendError(format!("simulated read failure: {}", path.display())));
        }
        match self.objects.read().await.get(&path) {
            Some(object) => Ok(object.data.clone()),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }

    fn faults<T>(&self, read: impl FnOnce(&Faults) -> T) -> Option<T> {
        self.faults.lock().ok().map(|faults| read(&faults))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        Self::with_files(Vec::<(PathBuf, Vec<u8>)>::new())
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RemoteEntryStream<'a> {
        let prefix = match prefix.map(validate_path).transpose() {
            Ok(prefix) => prefix,
            Err(err) => return Box::pin(futures::stream::once(async { Err(err) })),
        };
        let fails_after = self.faults(|faults| faults.listing_fails_after).flatten();

        Box::pin(stream! {
            // Copy out under the lock; nothing is held across a yield.
            let entries: Vec<RemoteEntry> = self
                .objects
                .read()
                .await
                .iter()
                .filter(|(path, _)| prefix.as_ref().is_none_or(|prefix| path.starts_with(prefix)))
                .map(|(path, object)| object.entry(path))
                .collect();
            for (listed, entry) in entries.into_iter().enumerate() {
                if fails_after == Some(listed) {
                    yield Err(Error::from(ErrorKind::BackendError("simulated listing failure".to_string())));
                    break;
                }
                yield Ok(entry);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.objects.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_reads.fetch_max(in_flight, Ordering::SeqCst);
        let result = self.read_object(path).await;
        self.reads_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.objects.write().await.insert(path, MockObject::new(data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        match self.objects.write().await.remove(&path) {
            Some(_) => Ok(()),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }
}
