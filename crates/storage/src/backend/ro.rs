//! Dry-run wrapper.
//!
//! Reads pass through to the wrapped destination. Writes and deletes are
//! logged, counted and reported as successful without touching anything, so
//! a retention plan can be rehearsed end to end.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{BackendHandle, RemoteEntry, StorageBackend, backend::RemoteEntryStream, error::Result};

pub struct ReadOnlyBackend {
    inner: BackendHandle,
    suppressed: AtomicU64,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner, suppressed: AtomicU64::new(0) }
    }

    /// Writes and deletes that were swallowed so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RemoteEntryStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<RemoteEntry>> {
        self.inner.list(prefix).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(backend = self.inner.name(), path = %path.display(), bytes = data.len(), "Dry run: not writing");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(backend = self.inner.name(), path = %path.display(), "Dry run: not deleting");
        Ok(())
    }
}
