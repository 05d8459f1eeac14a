//! Destinations.
//!
//! The index needs very little from a backup destination: a listing of
//! every object and the payload of small reference markers. Writes and
//! deletes exist for plan executors and test fixtures.

mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;

pub use self::local::{HASH_TYPE, LocalBackend, STAGING_DIR};
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
pub use self::ro::ReadOnlyBackend;
use crate::RemoteEntry;
use crate::error::Result;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub(crate) type RemoteEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<RemoteEntry>> + Send + 'a>>;

/// A backup destination holding immutable, timestamp-named objects.
///
/// Paths are relative to the destination root. Implementations run every
/// path through [`validate_path`](crate::validate_path) and reject those
/// that escape the root.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tempo_storage::{backend::StorageBackend, error::Result};
///
/// async fn reference_payload(backend: &dyn StorageBackend) -> Result<String> {
///     let bytes = backend.read(Path::new("docs/moved.20240102000000R.txt")).await?;
///     Ok(String::from_utf8_lossy(&bytes).trim().to_string())
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Shown in logs only.
    fn name(&self) -> &str;

    /// Collected [`list_stream()`](Self::list_stream).
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<RemoteEntry>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Every object at or below `prefix`, which is matched by whole path
    /// components (`sub` does not match `subdir/x`). Order is unspecified.
    ///
    /// An error item means the listing is incomplete.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use tempo_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(None);
    /// while let Some(entry) = stream.try_next().await? {
    ///     println!("{}: {} bytes", entry.path.display(), entry.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RemoteEntryStream<'a>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Whole object contents. Only used on reference markers, which hold a
    /// single stored name.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or overwrite an object, with any parent directories.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Fails with [`NotFound`](crate::error::ErrorKind::NotFound) for a
    /// missing object.
    async fn delete(&self, path: &Path) -> Result<()>;
}
