//! Two-phase mark-and-sweep garbage collection.
//!
//! A cycle starts with [`GarbageCollector::begin_mark_phase`]. The caller
//! marks every digest that live data references, then hands the phase to
//! [`GarbageCollector::sweep`], which walks the backend listing and reports
//! the unmarked blobs. The collector never deletes anything itself.
//!
//! Objects modified after `started_at - grace_period` are never reported:
//! they may have been stored by a writer the mark pass did not observe.
//! Backends that round modification times down (S3 keeps whole seconds) get
//! the cutoff moved back by their resolution, so a blob written just after
//! the phase began cannot look older than it is.

use crate::error::{GcError, GcResult};
use crate::metrics;
use dashmap::DashSet;
use depot_core::config::{GcConfig, normalize_prefix};
use depot_core::{Digest, DigestAlgorithm};
use depot_storage::{ListingOptions, ObjectEntry, ObjectStore};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use time::{Duration, OffsetDateTime, PrimitiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Lifecycle of a collection cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GcState {
    Idle,
    Marking,
    Sweeping,
}

impl GcState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Marking,
            2 => Self::Sweeping,
            _ => Self::Idle,
        }
    }
}

/// Blob counters for one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcStatus {
    /// Marked blobs found in the backend.
    pub num_binaries: u64,
    pub size_binaries: u64,
    /// Unmarked blobs old enough to be deleted.
    pub num_binaries_gc: u64,
    pub size_binaries_gc: u64,
    /// Unmarked blobs kept because they were modified during the grace period.
    pub num_binaries_recent: u64,
    pub size_binaries_recent: u64,
}

/// Resets the collector to idle when the cycle ends.
#[derive(Debug)]
struct CycleGuard {
    state: Arc<AtomicU8>,
}

impl CycleGuard {
    fn set(&self, state: GcState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.set(GcState::Idle);
    }
}

/// The set of live digests for one collection cycle.
///
/// Marking is safe from many tasks at once.
#[derive(Debug)]
pub struct MarkPhase {
    marks: DashSet<Digest>,
    started_at: OffsetDateTime,
    algorithm: DigestAlgorithm,
    guard: CycleGuard,
}

impl MarkPhase {
    /// Mark a digest as live. Returns false if it was already marked.
    pub fn mark(&self, digest: &Digest) -> bool {
        self.marks.insert(digest.clone())
    }

    /// Parse and mark a digest of the collector's algorithm.
    pub fn mark_str(&self, digest: &str) -> GcResult<bool> {
        let digest = Digest::parse_as(digest, self.algorithm)
            .map_err(|e| GcError::InvalidMark(e.to_string()))?;
        Ok(self.marks.insert(digest))
    }

    pub fn is_marked(&self, digest: &Digest) -> bool {
        self.marks.contains(digest)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }
}

/// Outcome of a sweep.
#[derive(Clone, Debug, Serialize)]
pub struct SweepReport {
    /// Unmarked blobs past the grace period.
    pub collectible: HashSet<Digest>,
    /// Marked digests with no object in the backend, sorted.
    pub missing: Vec<Digest>,
    pub status: GcStatus,
    pub pages: u64,
    /// Keys under the prefix that are not digests.
    pub skipped_keys: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

/// Finds unreferenced blobs under one prefix of one backend.
pub struct GarbageCollector {
    backend: Arc<dyn ObjectStore>,
    prefix: String,
    algorithm: DigestAlgorithm,
    grace_period: Duration,
    page_size: usize,
    state: Arc<AtomicU8>,
}

impl GarbageCollector {
    pub fn new(
        backend: Arc<dyn ObjectStore>,
        prefix: &str,
        algorithm: DigestAlgorithm,
        config: &GcConfig,
    ) -> Self {
        Self {
            backend,
            prefix: normalize_prefix(prefix),
            algorithm,
            grace_period: config.grace_period(),
            page_size: config.page_size,
            state: Arc::new(AtomicU8::new(GcState::Idle as u8)),
        }
    }

    /// `"<backend>:<prefix>"`, used to tell collectors apart in logs.
    pub fn id(&self) -> String {
        format!("{}:{}", self.backend.backend_name(), self.prefix)
    }

    pub fn state(&self) -> GcState {
        GcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Start a cycle. Fails while another phase of this collector is alive.
    pub fn begin_mark_phase(&self) -> GcResult<MarkPhase> {
        self.state
            .compare_exchange(
                GcState::Idle as u8,
                GcState::Marking as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| GcError::CycleInProgress(self.id()))?;

        let phase = MarkPhase {
            marks: DashSet::new(),
            started_at: OffsetDateTime::now_utc(),
            algorithm: self.algorithm,
            guard: CycleGuard {
                state: Arc::clone(&self.state),
            },
        };
        tracing::info!(collector = %self.id(), "Started GC mark phase");
        Ok(phase)
    }

    /// Walk the listing and classify every blob against the marks.
    ///
    /// Cancellation is observed while waiting for each page.
    #[instrument(skip(self, phase, cancel), fields(collector = %self.id(), marks = phase.len()))]
    pub async fn sweep(
        &self,
        phase: MarkPhase,
        cancel: &CancellationToken,
    ) -> GcResult<SweepReport> {
        if !Arc::ptr_eq(&phase.guard.state, &self.state) {
            return Err(GcError::ForeignPhase);
        }
        phase.guard.set(GcState::Sweeping);

        let resolution = self.backend.listing_capabilities().timestamp_resolution;
        let cutoff = phase
            .started_at
            .checked_sub(self.grace_period.saturating_add(resolution))
            .unwrap_or(PrimitiveDateTime::MIN.assume_utc());
        tracing::debug!(%cutoff, %resolution, "Sweeping blobs last modified at or before cutoff");
        let mut sweep = Sweep::new(&phase, cutoff);
        let mut pages = self.backend.list_pages(
            &self.prefix,
            ListingOptions::new(self.page_size),
            None,
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!(pages = sweep.pages, "GC sweep cancelled");
                    metrics::record_gc_cycle("cancelled");
                    return Err(GcError::Cancelled { pages: sweep.pages });
                }
                next = pages.next() => next,
            };

            let page = match next {
                Some(Ok(page)) => page,
                Some(Err(e)) => {
                    tracing::warn!(pages = sweep.pages, error = %e, "Failed to fetch listing page, aborting sweep");
                    metrics::record_gc_cycle("failed");
                    return Err(e.into());
                }
                None => break,
            };

            sweep.pages += 1;
            metrics::GC_LISTING_PAGES.inc();
            for entry in page.objects {
                self.classify(&mut sweep, entry);
            }
        }

        let mut missing: Vec<Digest> = phase.marks.iter().map(|d| d.key().clone()).collect();
        missing.sort();
        if !missing.is_empty() {
            metrics::GC_MISSING_MARKS.inc_by(missing.len() as u64);
            tracing::warn!(
                count = missing.len(),
                first = %missing[0],
                "Marked digests have no object in the backend"
            );
        }

        let report = SweepReport {
            collectible: sweep.collectible,
            missing,
            status: sweep.status,
            pages: sweep.pages,
            skipped_keys: sweep.skipped_keys,
            started_at: phase.started_at,
            finished_at: OffsetDateTime::now_utc(),
        };

        metrics::GC_BYTES_COLLECTIBLE.inc_by(report.status.size_binaries_gc);
        metrics::record_gc_cycle("completed");
        tracing::info!(
            live = report.status.num_binaries,
            collectible = report.status.num_binaries_gc,
            collectible_bytes = report.status.size_binaries_gc,
            recent = report.status.num_binaries_recent,
            missing = report.missing.len(),
            skipped_keys = report.skipped_keys,
            pages = report.pages,
            "GC sweep completed"
        );
        Ok(report)
    }

    fn classify(&self, sweep: &mut Sweep<'_>, entry: ObjectEntry) {
        let digest = entry
            .key
            .strip_prefix(&self.prefix)
            .and_then(|name| Digest::parse_as(name, self.algorithm).ok());
        let Some(digest) = digest else {
            tracing::debug!(key = %entry.key, "Key is not a blob digest, skipping");
            sweep.skipped_keys += 1;
            return;
        };

        let status = &mut sweep.status;
        if sweep.phase.marks.remove(&digest).is_some() {
            status.num_binaries += 1;
            status.size_binaries += entry.size;
        } else if entry.last_modified.is_some_and(|t| t <= sweep.cutoff) {
            status.num_binaries_gc += 1;
            status.size_binaries_gc += entry.size;
            sweep.collectible.insert(digest);
        } else {
            tracing::trace!(key = %entry.key, "Unmarked blob is within the grace period, keeping");
            status.num_binaries_recent += 1;
            status.size_binaries_recent += entry.size;
        }
    }
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("id", &self.id())
            .field("algorithm", &self.algorithm)
            .field("grace_period", &self.grace_period)
            .field("page_size", &self.page_size)
            .field("state", &self.state())
            .finish()
    }
}

/// Accumulators of one sweep.
struct Sweep<'a> {
    phase: &'a MarkPhase,
    cutoff: OffsetDateTime,
    status: GcStatus,
    collectible: HashSet<Digest>,
    pages: u64,
    skipped_keys: u64,
}

impl<'a> Sweep<'a> {
    fn new(phase: &'a MarkPhase, cutoff: OffsetDateTime) -> Self {
        Self {
            phase,
            cutoff,
            status: GcStatus::default(),
            collectible: HashSet::new(),
            pages: 0,
            skipped_keys: 0,
        }
    }
}
