//! Stored name codec.
//!
//! A stored name is the logical path with a time token spliced in before the
//! extension: `docs/report.txt` at 2024-01-01 becomes
//! `docs/report.20240101000000.txt`, its delete marker
//! `docs/report.20240101000000D.txt` and a dedup reference
//! `docs/report.20240101000000R.txt`.
//!
//! Leading dots belong to the stem, so `.bashrc` has no extension and is
//! stored as `.bashrc.20240101000000`.

use crate::Timestamp;
use crate::error::{ErrorKind, Result};
use std::fmt;

/// Lifecycle flag carried by a stored name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    /// No flag: real content bytes.
    Content,
    /// `D`: the logical path stops existing at this timestamp.
    Delete,
    /// `R`: the object's payload is the stored name of the real bytes.
    Reference,
}
impl Flag {
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Content => "",
            Self::Delete => "D",
            Self::Reference => "R",
        }
    }
}
impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Result of decoding a stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub apath: String,
    pub timestamp: Timestamp,
    pub flag: Flag,
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((parent, name)) => (&path[..parent.len() + 1], name),
        None => ("", path),
    }
}

fn split_leading_dots(name: &str) -> (&str, &str) {
    let rest = name.trim_start_matches('.');
    name.split_at(name.len() - rest.len())
}

/// Build the stored name for `apath` at `timestamp`.
pub fn encode(apath: &str, timestamp: Timestamp, flag: Flag) -> String {
    let (parent, name) = split_parent(apath);
    let (dots, rest) = split_leading_dots(name);
    match rest.rsplit_once('.') {
        Some((stem, ext)) => format!("{parent}{dots}{stem}.{timestamp}{flag}.{ext}"),
        None => format!("{parent}{name}.{timestamp}{flag}"),
    }
}

/// Recover the logical path, timestamp and flag from a stored name.
///
/// # Errors
///
/// [`ErrorKind::MalformedName`] when the name has no segment that reads as a
/// time token.
pub fn decode(stored_name: &str) -> Result<Decoded> {
    let malformed = || exn::Exn::from(ErrorKind::MalformedName(stored_name.to_string()));
    let (parent, name) = split_parent(stored_name);
    let (dots, rest) = split_leading_dots(name);
    let segments: Vec<&str> = rest.split('.').collect();
    let (apath_name, token) = match segments.as_slice() {
        // A basename made only of dots is stored as `<dots>.<token>`.
        [token] if dots.len() > 1 => (dots[..dots.len() - 1].to_string(), *token),
        [] | [_] => return Err(malformed()),
        [stem, token] => (format!("{dots}{stem}"), *token),
        [stem @ .., token, ext] => (format!("{dots}{}.{ext}", stem.join(".")), *token),
    };

    let (token, flag) = match token.as_bytes().last() {
        Some(b'D') => (&token[..token.len() - 1], Flag::Delete),
        Some(b'R') => (&token[..token.len() - 1], Flag::Reference),
        _ => (token, Flag::Content),
    };
    let timestamp = Timestamp::from_token(token).ok_or_else(malformed)?;
    Ok(Decoded { apath: format!("{parent}{apath_name}"), timestamp, flag })
}
