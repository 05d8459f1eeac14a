//! Index Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Row-level kinds ([`ErrorKind::MalformedName`],
//! [`ErrorKind::BrokenReference`]) are absorbed where they occur and only
//! counted; everything else aborts the operation that raised it.

use derive_more::{Display, Error};

/// An index error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A listed object name carries no decodable timestamp.
    #[display("no timestamp in stored name: {_0}")]
    MalformedName(#[error(not(source))] String),
    /// A reference marker whose referent could not be read or found.
    #[display("broken reference: {_0}")]
    BrokenReference(#[error(not(source))] String),
    /// The index database cannot be opened, created or migrated.
    #[display("index database unavailable")]
    IndexUnavailable,
    /// A write batch was rolled back.
    #[display("inconsistent write batch; nothing was committed")]
    InconsistentBatch,
    /// A resolved reference points at a row that no longer exists.
    #[display("resolved reference {_0} points at a missing referent")]
    MissingReferent(#[error(not(source))] String),
    /// Retention cannot be planned while references are unresolved.
    #[display("{_0} reference(s) still unresolved")]
    PendingReferences(#[error(not(source))] u64),
    #[display("database error")]
    Database,
    /// The remote listing failed part way through.
    #[display("remote listing failed")]
    Listing,
    /// Serialization/deserialization error.
    #[display("invalid index data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    #[display("invalid timestamp: {_0}")]
    InvalidTimestamp(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::MalformedName("notes.txt".to_string()).to_string(), "no timestamp in stored name: notes.txt");
        assert_eq!(ErrorKind::PendingReferences(3).to_string(), "3 reference(s) still unresolved");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Listing.is_retryable());
        assert!(!ErrorKind::InconsistentBatch.is_retryable());
        assert!(!ErrorKind::MissingReferent("a.19700101000001R.txt".to_string()).is_retryable());
    }
}
