//! Content-addressed blob store for depot.
//!
//! This crate provides:
//! - Digest-keyed storage with integrity checks on read
//! - Two-phase mark-and-sweep garbage collection over a paginated listing
//! - Signed direct download links
//! - Prometheus metrics

pub mod binary_store;
pub mod error;
pub mod file_storage;
pub mod gc;
pub mod metrics;

pub use binary_store::{BinaryStore, GcReport, RemovalSummary};
pub use error::{GcError, GcResult, StoreError, StoreResult};
pub use file_storage::{FileStorage, StoreOutcome};
pub use gc::{GarbageCollector, GcState, GcStatus, MarkPhase, SweepReport};
