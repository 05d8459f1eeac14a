mod row;

pub(crate) use self::row::{HistoryRow, SnapshotRow, VersionRow};
use crate::Timestamp;
use crate::codec::{self, Flag};
use serde_json::{Map, Value};
use tempo_storage::Hashes;

/// Size recorded for rows that own no bytes.
pub const NO_SIZE: i64 = -1;

/// Where a version stands in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Lifecycle {
    /// Real bytes exist at the stored name.
    Content { size: u64, mtime: Option<f64>, checksum: Hashes },
    /// The logical path does not exist from this timestamp on.
    Delete,
    /// A reference marker whose payload has not been read yet.
    ReferencePending,
    /// A reference marker borrowing the bytes of `target`.
    ReferenceResolved { target: String, size: u64, mtime: Option<f64>, checksum: Hashes },
    /// A reference marker whose referent could not be found. Behaves as a
    /// delete.
    ReferenceBroken { target: Option<String> },
}
impl Lifecycle {
    pub fn flag(&self) -> Flag {
        match self {
            Self::Content { .. } => Flag::Content,
            Self::Delete => Flag::Delete,
            Self::ReferencePending | Self::ReferenceResolved { .. } | Self::ReferenceBroken { .. } => Flag::Reference,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.flag() == Flag::Reference
    }

    /// The logical path does not exist while this version is current.
    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::Delete | Self::ReferenceBroken { .. })
    }

    pub fn target(&self) -> Option<&str> {
        match self {
            Self::ReferenceResolved { target, .. } => Some(target),
            Self::ReferenceBroken { target } => target.as_deref(),
            _ => None,
        }
    }
}

/// One row of the index: a logical path at one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    pub stored_name: String,
    pub apath: String,
    pub timestamp: Timestamp,
    pub lifecycle: Lifecycle,
    /// Metadata came from the destination listing rather than the source.
    pub from_destination: bool,
    /// Attributes without a dedicated column.
    pub extra: Map<String, Value>,
}
impl Version {
    /// A version whose stored name is derived from its identity.
    pub fn new(apath: impl Into<String>, timestamp: Timestamp, lifecycle: Lifecycle) -> Self {
        let apath = apath.into();
        Self {
            stored_name: codec::encode(&apath, timestamp, lifecycle.flag()),
            apath,
            timestamp,
            lifecycle,
            from_destination: false,
            extra: Map::new(),
        }
    }

    /// Recorded size, or [`NO_SIZE`] for rows that own no bytes.
    ///
    /// Resolved references report the size they borrow from their referent.
    pub fn size(&self) -> i64 {
        match &self.lifecycle {
            Lifecycle::Content { size, .. } | Lifecycle::ReferenceResolved { size, .. } => {
                i64::try_from(*size).unwrap_or(i64::MAX)
            },
            _ => NO_SIZE,
        }
    }

    pub fn mtime(&self) -> Option<f64> {
        match &self.lifecycle {
            Lifecycle::Content { mtime, .. } | Lifecycle::ReferenceResolved { mtime, .. } => *mtime,
            _ => None,
        }
    }

    pub fn checksum(&self) -> Option<&Hashes> {
        match &self.lifecycle {
            Lifecycle::Content { checksum, .. } | Lifecycle::ReferenceResolved { checksum, .. } => Some(checksum),
            _ => None,
        }
    }
}

/// A version together with the number of rows referencing its stored name.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version: Version,
    /// Only populated when reference counts were requested.
    pub ref_count: Option<u64>,
}
