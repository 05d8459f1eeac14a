//! Storage models.
//!
//! A [`RemoteEntry`] is one object as reported by a backend listing: the raw
//! material that the index classifies into versions.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use time::OffsetDateTime;

/// Hash type name → hex digest, as reported by the backend.
pub type Hashes = BTreeMap<String, String>;

/// Object metadata returned by storage backend listings.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEntry {
    /// Relative path from storage root
    pub path: PathBuf,
    /// Object size in bytes, as reported by the backend
    pub size: u64,
    /// Last modified timestamp, if the backend reports one
    pub modified: Option<OffsetDateTime>,
    /// Content digests, if the backend computes them
    pub hashes: Hashes,
    /// Provider-specific attributes that have no dedicated field.
    pub extra: Map<String, Value>,
}
impl RemoteEntry {
    /// Create a new entry from a listing operation (no hashes, no extras).
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: Option<OffsetDateTime>) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            hashes: Hashes::new(),
            extra: Map::new(),
        }
    }

    pub fn with_hash(mut self, kind: impl Into<String>, digest: impl Into<String>) -> Self {
        self.hashes.insert(kind.into(), digest.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The `/`-separated object key, or `None` for non-UTF-8 paths.
    pub fn key(&self) -> Option<String> {
        crate::path::to_key(&self.path)
    }

    /// Modification time as fractional seconds since the Unix epoch.
    pub fn mtime(&self) -> Option<f64> {
        self.modified.map(|m| m.unix_timestamp_nanos() as f64 / 1e9)
    }
}
