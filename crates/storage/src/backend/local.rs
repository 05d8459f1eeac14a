//! Destination on a locally mounted filesystem: an external drive, a NAS
//! share, or a plain directory used in tests.

use crate::backend::RemoteEntryStream;
use crate::error::{Error, ErrorKind, Result};
use crate::{RemoteEntry, StorageBackend, path::validate as validate_path};
use async_stream::try_stream;
use async_trait::async_trait;
use exn::ResultExt;
use futures::Stream;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Hash type name reported for digests computed by this backend.
pub const HASH_TYPE: &str = "blake3";

/// Directory below the root that holds writes in progress. Never listed.
pub const STAGING_DIR: &str = ".tempo-staging";

const HASH_CHUNK: usize = 64 * 1024;

static STAGED: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage backend.
///
/// Symbolic links are not followed and never listed, and neither is
/// [`STAGING_DIR`].
///
/// # Examples
///
/// ```no_run
/// use tempo_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("usb-drive", "/mnt/backup")?.with_hashes(true);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct LocalBackend {
    name: String,
    root: PathBuf,
    hashes: bool,
}
impl LocalBackend {
    /// Use `root` as the destination, creating it if it does not exist yet.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidPath`] if `root` is relative or is not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() || (root.exists() && !root.is_dir()) {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        // Blocking, but only once per process.
        std::fs::create_dir_all(&root).map_err(|err| io_error(&root, err))?;
        Ok(Self { name: name.into(), root, hashes: false })
    }

    /// Digest every listed object. This reads each object in full, so it is
    /// off unless the destination reports no checksums of its own.
    pub fn with_hashes(mut self, hashes: bool) -> Self {
        self.hashes = hashes;
        self
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        Ok(self.root.join(validate_path(path)?))
    }

    async fn describe(&self, absolute: &Path) -> Result<RemoteEntry> {
        let metadata = fs::metadata(absolute).await.map_err(|err| io_error(absolute, err))?;
        let relative = absolute
            .strip_prefix(&self.root)
            .or_raise(|| ErrorKind::BackendError(format!("{} is outside {}", absolute.display(), self.root.display())))?;
        let modified = metadata.modified().ok().map(OffsetDateTime::from);
        let entry = RemoteEntry::new(relative, metadata.len(), modified);
        match self.hashes {
            true => Ok(entry.with_hash(HASH_TYPE, digest(absolute).await?)),
            false => Ok(entry),
        }
    }

    /// Breadth-first walk from `start`, which may be a single object.
    fn walk(&self, start: PathBuf) -> impl Stream<Item = Result<RemoteEntry>> + Send + '_ {
        let staging = self.staging_dir();
        try_stream! {
            let mut pending = VecDeque::from([start]);
            while let Some(current) = pending.pop_front() {
                if current == staging {
                    continue;
                }
                let file_type = match fs::symlink_metadata(&current).await {
                    Ok(metadata) => metadata.file_type(),
                    // An unused prefix lists nothing, the same as on an object store.
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => Err(io_error(&current, err))?,
                };
                if file_type.is_file() {
                    yield self.describe(&current).await?;
                } else if file_type.is_dir() {
                    let mut children = fs::read_dir(&current).await.map_err(|err| io_error(&current, err))?;
                    while let Some(child) = children.next_entry().await.map_err(|err| io_error(&current, err))? {
                        pending.push_back(child.path());
                    }
                }
            }
        }
    }
}

fn io_error(path: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
        _ => ErrorKind::Io(err),
    };
    Error::from(kind)
}

async fn digest(absolute: &Path) -> Result<String> {
    let mut file = fs::File::open(absolute).await.map_err(|err| io_error(absolute, err))?;
    let mut hasher = blake3::Hasher::new();
    let mut chunk = vec![0; HASH_CHUNK];
    loop {
        match file.read(&mut chunk).await.map_err(|err| io_error(absolute, err))? {
            0 => break,
            read => hasher.update(&chunk[..read]),
        };
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RemoteEntryStream<'a> {
        match prefix.map(|prefix| self.resolve(prefix)).transpose() {
            Ok(start) => Box::pin(self.walk(start.unwrap_or_else(|| self.root.clone()))),
            Err(err) => Box::pin(futures::stream::once(async { Err(err) })),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let absolute = self.resolve(path)?;
        fs::try_exists(&absolute).await.map_err(|err| io_error(&absolute, err))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let absolute = self.resolve(path)?;
        fs::read(&absolute).await.map_err(|err| io_error(path, err))
    }

    /// Written below [`STAGING_DIR`] and renamed into place, so a listing
    /// never sees a partial object. A failed write removes its staging file.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let absolute = self.resolve(path)?;
        let (Some(parent), Some(file_name)) = (absolute.parent(), absolute.file_name()) else {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        };
        if absolute.starts_with(self.staging_dir()) {
            exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
        }
        fs::create_dir_all(parent).await.map_err(|err| io_error(path, err))?;
        let staging_dir = self.staging_dir();
        fs::create_dir_all(&staging_dir).await.map_err(|err| io_error(&staging_dir, err))?;

        let staged = STAGED.fetch_add(1, Ordering::Relaxed);
        let staging = staging_dir.join(format!("{}.{staged}.{}", std::process::id(), file_name.to_string_lossy()));
        let written = match fs::write(&staging, data).await {
            Ok(()) => fs::rename(&staging, &absolute).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&staging).await
                && cleanup.kind() != io::ErrorKind::NotFound
            {
                tracing::warn!(path = %staging.display(), error = %cleanup, "Could not remove staging file");
            }
            return Err(io_error(path, err));
        }
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let absolute = self.resolve(path)?;
        fs::remove_file(&absolute).await.map_err(|err| io_error(path, err))
    }
}
