//! Object paths.
//!
//! A destination object is addressed by a relative path that may never leave
//! the destination root. Above this crate stored names are plain strings
//! joined with `/` ([`to_key`]), whatever the host platform's separator.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Resolve `.` and `..` lexically. `None` if the path climbs above the root,
/// names a drive prefix, or contains a NUL byte.
fn normal_components(path: &Path) -> Option<Vec<&OsStr>> {
    let mut stack = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) if name.as_encoded_bytes().contains(&0) => return None,
            Component::Normal(name) => stack.push(name),
            Component::ParentDir => {
                stack.pop()?;
            },
            Component::Prefix(_) => return None,
            Component::CurDir | Component::RootDir => {},
        }
    }
    Some(stack)
}

/// Normalize an object path relative to the destination root.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tempo_storage::validate_path;
///
/// let path = validate_path("./photos/../docs//report.20240101000000.txt")?;
/// assert_eq!(path, Path::new("docs/report.20240101000000.txt"));
/// assert!(validate_path("../outside.20240101000000").is_err());
/// # Ok::<(), tempo_storage::error::Error>(())
/// ```
///
/// # Errors
///
/// [`ErrorKind::InvalidPath`] when the path escapes the root, is empty once
/// normalized, or contains a NUL byte.
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    match normal_components(path) {
        Some(components) if !components.is_empty() => Ok(components.into_iter().collect()),
        _ => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
    }
}

/// The stored name for a relative path, or `None` if it is not UTF-8 or
/// does not normalize.
pub fn to_key(path: impl AsRef<Path>) -> Option<String> {
    let names = normal_components(path.as_ref())?
        .into_iter()
        .map(OsStr::to_str)
        .collect::<Option<Vec<_>>>()?;
    Some(names.join("/"))
}
