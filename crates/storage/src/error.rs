//! Destination access errors.
//!
//! The index raises these into its own kinds with `or_raise`, so a failed
//! marker read still shows which object and which backend call failed.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong talking to a destination.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Missing object. Expected for a marker whose object was pruned.
    #[display("object not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Credentials or filesystem permissions.
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Escapes the destination root, or is empty.
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Provider failure with no better category.
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Transient failures; a listing or marker read may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::BackendError(_))
    }
}
