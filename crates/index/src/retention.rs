//! Retention Planner.
//!
//! Every version is valid from its own timestamp until the next version of
//! the same path replaces it (its *death*). Given a cutoff `N`, a version is
//! eligible for deletion once it died strictly before `N`; the newest version
//! of a path never dies and is never eligible.
//!
//! Content that a reference still borrows stays, unless that reference is
//! planned for deletion in the same pass. The plan is advisory: deleting the
//! objects and acknowledging them back to the index is up to the caller.

use crate::Timestamp;
use crate::error::{Error, ErrorKind, Result};
use crate::models::Lifecycle;
use crate::query::normalize_prefix;
use crate::store::VersionStore;
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::str::FromStr;
use std::time::Duration;

/// User-facing retention setting, resolved to a cutoff instant before
/// planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Versions that died before this instant may go.
    Before(Timestamp),
    /// Keep everything needed to restore any instant in the last `Duration`.
    KeepFor(Duration),
}
impl RetentionPolicy {
    pub fn cutoff(&self, now: Timestamp) -> Result<Timestamp> {
        match self {
            Self::Before(cutoff) => Ok(*cutoff),
            Self::KeepFor(duration) => now
                .checked_sub(*duration)
                .ok_or_raise(|| ErrorKind::InvalidTimestamp(humantime::format_duration(*duration).to_string())),
        }
    }
}

impl FromStr for RetentionPolicy {
    type Err = Error;

    /// A duration (`30days`, `1y 6months`) keeps that much history; anything
    /// else must be an absolute instant.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(duration) = humantime::parse_duration(trimmed) {
            return Ok(Self::KeepFor(duration));
        }
        Ok(Self::Before(trimmed.parse::<Timestamp>().or_raise(|| ErrorKind::InvalidTimestamp(s.to_string()))?))
    }
}

/// Objects chosen for deletion, ordered by stored name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPlan {
    cutoff: Timestamp,
    entries: BTreeMap<String, i64>,
    reclaimable_bytes: u64,
}
impl RetentionPlan {
    pub fn cutoff(&self) -> Timestamp {
        self.cutoff
    }

    /// `(stored name, recorded size)` pairs. Delete markers and broken
    /// references carry size `-1`.
    pub fn entries(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(name, size)| (name.as_str(), *size))
    }

    pub fn stored_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, stored_name: &str) -> bool {
        self.entries.contains_key(stored_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes freed by deleting the planned content objects. References only
    /// borrow bytes and do not count.
    pub fn reclaimable_bytes(&self) -> u64 {
        self.reclaimable_bytes
    }
}

struct Candidate {
    size: i64,
    owns_bytes: bool,
}

/// Plan which rows may be deleted for `cutoff`, considering only paths below
/// `prefix` as candidates.
///
/// References anywhere in the index are honoured, including ones outside
/// `prefix`. The whole scan runs in one read transaction.
///
/// # Errors
///
/// [`ErrorKind::PendingReferences`] while any reference is unresolved, since
/// its target is unknown.
pub async fn plan_retention(store: &VersionStore, cutoff: Timestamp, prefix: Option<&str>) -> Result<RetentionPlan> {
    let prefix = prefix.and_then(normalize_prefix);
    let mut planned: HashMap<String, Candidate> = HashMap::new();
    // (reference stored name, target stored name)
    let mut references: Vec<(String, String)> = Vec::new();

    let mut tx = store.database().pool().begin().await.or_raise(|| ErrorKind::Database)?;
    let pending = VersionStore::pending_count_on(&mut tx).await?;
    if pending > 0 {
        exn::bail!(ErrorKind::PendingReferences(pending));
    }
    {
        let mut groups = pin!(VersionStore::grouped_on(&mut tx));
        while let Some((apath, versions)) = groups.try_next().await? {
            for version in &versions {
                if let Lifecycle::ReferenceResolved { target, .. } = &version.lifecycle {
                    references.push((version.stored_name.clone(), target.clone()));
                }
            }
            if !prefix.as_deref().is_none_or(|prefix| apath.starts_with(prefix)) {
                continue;
            }
            for (version, successor) in versions.iter().zip(versions.iter().skip(1)) {
                if successor.timestamp < cutoff {
                    let owns_bytes = matches!(version.lifecycle, Lifecycle::Content { .. });
                    planned.insert(version.stored_name.clone(), Candidate { size: version.size(), owns_bytes });
                }
            }
        }
    }
    tx.commit().await.or_raise(|| ErrorKind::Database)?;

    loop {
        let blocked: Vec<&String> = references
            .iter()
            .filter(|(reference, target)| !planned.contains_key(reference) && planned.contains_key(target))
            .map(|(_, target)| target)
            .collect();
        if blocked.is_empty() {
            break;
        }
        for target in blocked {
            tracing::debug!(stored_name = %target, "Keeping version still borrowed by a reference");
            planned.remove(target);
        }
    }

    let reclaimable_bytes = planned
        .values()
        .filter(|candidate| candidate.owns_bytes)
        .map(|candidate| u64::try_from(candidate.size).unwrap_or(0))
        .sum();
    let entries: BTreeMap<String, i64> = planned.into_iter().map(|(name, candidate)| (name, candidate.size)).collect();
    tracing::info!(%cutoff, prefix = ?prefix, planned = entries.len(), reclaimable_bytes, "Planned retention");
    Ok(RetentionPlan { cutoff, entries, reclaimable_bytes })
}
