//! Reference Resolver.
//!
//! A reference marker's payload is the stored name of the content it
//! borrows. Resolution reads every pending marker, copies the referent's
//! metadata onto the reference row and rewrites all of them in one replace
//! batch. A referent that cannot be read or found degrades the row to
//! [`Lifecycle::ReferenceBroken`] instead of failing the run.

use crate::error::{ErrorKind, Result};
use crate::models::{Lifecycle, Version};
use crate::store::{VersionStore, WriteMode};
use exn::ResultExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use std::path::Path;
use tempo_storage::StorageBackend;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResolveReport {
    pub resolved: u64,
    pub broken: u64,
}

/// Resolve every pending reference, reading at most `concurrency` markers
/// at a time.
pub async fn resolve_references(
    store: &VersionStore,
    backend: &dyn StorageBackend,
    concurrency: usize,
) -> Result<ResolveReport> {
    let mut queue: VecDeque<_> = store
        .pending_references()
        .await?
        .into_iter()
        .map(|reference| resolve_one(store, backend, reference))
        .collect();
    if queue.is_empty() {
        return Ok(ResolveReport::default());
    }
    tracing::info!(pending = queue.len(), concurrency, backend = backend.name(), "Resolving references");

    let mut in_flight = FuturesUnordered::new();
    in_flight.extend(queue.drain(..concurrency.max(1).min(queue.len())));
    let mut rows = Vec::with_capacity(in_flight.len() + queue.len());
    while let Some(result) = in_flight.next().await {
        rows.push(result?);
        if let Some(next) = queue.pop_front() {
            in_flight.push(next);
        }
    }

    let mut report = ResolveReport::default();
    for row in &rows {
        match row.lifecycle {
            Lifecycle::ReferenceResolved { .. } => report.resolved += 1,
            _ => report.broken += 1,
        }
    }
    store.insert(&rows, WriteMode::REPLACE).await?;
    tracing::info!(resolved = report.resolved, broken = report.broken, "Resolved references");
    Ok(report)
}

/// Read the referent's stored name out of the marker.
async fn read_target(backend: &dyn StorageBackend, reference: &Version) -> Result<String> {
    let broken = || ErrorKind::BrokenReference(reference.stored_name.clone());
    let payload = backend.read(Path::new(&reference.stored_name)).await.or_raise(broken)?;
    let payload = String::from_utf8(payload).or_raise(broken)?;
    match payload.trim() {
        "" => exn::bail!(broken()),
        target => Ok(target.to_string()),
    }
}

async fn resolve_one(store: &VersionStore, backend: &dyn StorageBackend, reference: Version) -> Result<Version> {
    let target = match read_target(backend, &reference).await {
        Ok(target) => target,
        Err(err) => {
            tracing::warn!(error = ?err, "Reference marker unreadable; treating as deleted");
            return Ok(Version { lifecycle: Lifecycle::ReferenceBroken { target: None }, ..reference });
        },
    };
    match store.content_by_stored_name(&target).await? {
        Some(referent) => {
            let Lifecycle::Content { size, mtime, checksum } = referent.lifecycle else {
                exn::bail!(ErrorKind::InvalidData("referent lifecycle"));
            };
            Ok(Version {
                lifecycle: Lifecycle::ReferenceResolved { target, size, mtime, checksum },
                extra: referent.extra,
                ..reference
            })
        },
        None => {
            tracing::warn!(
                stored_name = %reference.stored_name,
                %target,
                "Referent is not indexed content; treating reference as deleted"
            );
            Ok(Version { lifecycle: Lifecycle::ReferenceBroken { target: Some(target) }, ..reference })
        },
    }
}
