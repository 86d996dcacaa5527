//! Prometheus metrics for the blob store.
//!
//! Metrics live in a private registry. Call [`register_metrics`] once at
//! startup and [`render_metrics`] to produce the text exposition format.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Registry holding every depot metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Blob writes and reads
pub static BLOBS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_blobs_stored_total", "Total number of blobs uploaded")
        .expect("metric creation failed")
});

pub static BLOBS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_blobs_deduplicated_total",
        "Total number of store calls skipped because the blob already existed",
    )
    .expect("metric creation failed")
});

pub static BLOBS_REPAIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_blobs_repaired_total",
        "Total number of blobs re-uploaded over an object with a mismatching checksum",
    )
    .expect("metric creation failed")
});

pub static BYTES_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_bytes_stored_total", "Total bytes uploaded")
        .expect("metric creation failed")
});

pub static INTEGRITY_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_integrity_failures_total",
        "Total number of fetches rejected because content did not match its digest",
    )
    .expect("metric creation failed")
});

// GC metrics
pub static GC_CYCLES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("depot_gc_cycles_total", "Total GC sweeps by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static GC_LISTING_PAGES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_listing_pages_total",
        "Total listing pages fetched by GC sweeps",
    )
    .expect("metric creation failed")
});

pub static GC_ITEMS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_items_deleted_total",
        "Total number of unreferenced blobs deleted",
    )
    .expect("metric creation failed")
});

pub static GC_BYTES_COLLECTIBLE: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_bytes_collectible_total",
        "Total bytes found collectible by GC sweeps",
    )
    .expect("metric creation failed")
});

pub static GC_MISSING_MARKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_missing_marks_total",
        "Total number of marked digests with no object in the backend",
    )
    .expect("metric creation failed")
});

pub static GC_DELETE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_gc_delete_failures_total",
        "Total number of failed best-effort deletes",
    )
    .expect("metric creation failed")
});

// Direct download links
pub static DIRECT_LINKS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_direct_links_issued_total",
        "Total number of signed download links issued",
    )
    .expect("metric creation failed")
});

pub static SIGNING_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_signing_failures_total",
        "Total number of signed link requests that failed",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the depot registry.
///
/// Idempotent: calls after the first are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(BLOBS_STORED.clone()),
            Box::new(BLOBS_DEDUPLICATED.clone()),
            Box::new(BLOBS_REPAIRED.clone()),
            Box::new(BYTES_STORED.clone()),
            Box::new(INTEGRITY_FAILURES.clone()),
            Box::new(GC_CYCLES.clone()),
            Box::new(GC_LISTING_PAGES.clone()),
            Box::new(GC_ITEMS_DELETED.clone()),
            Box::new(GC_BYTES_COLLECTIBLE.clone()),
            Box::new(GC_MISSING_MARKS.clone()),
            Box::new(GC_DELETE_FAILURES.clone()),
            Box::new(DIRECT_LINKS_ISSUED.clone()),
            Box::new(SIGNING_FAILURES.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::error!(error = %e, "metric registration failed");
            }
        }
    });
}

/// Encode all registered metrics in the Prometheus text format.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&REGISTRY.gather())
}

/// Record the end of a GC sweep.
pub fn record_gc_cycle(outcome: &str) {
    GC_CYCLES.with_label_values(&[outcome]).inc();
}
