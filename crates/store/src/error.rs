//! Blob store error types.

use depot_core::{Digest, DigestAlgorithm};
use depot_signer::SignerError;
use depot_storage::StorageError;
use thiserror::Error;

/// Blob store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("integrity check failed for {digest}: backend content hashes to {actual}")]
    Integrity { digest: Digest, actual: String },

    #[error("digest {digest} is not a {expected} digest")]
    AlgorithmMismatch {
        digest: Digest,
        expected: DigestAlgorithm,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("signing error: {0}")]
    Signing(#[from] SignerError),

    #[error("direct download is not enabled")]
    DirectDownloadDisabled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("garbage collection error: {0}")]
    Gc(#[from] GcError),
}

impl StoreError {
    /// Whether the same call may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Storage(e) => e.is_transient(),
            StoreError::Gc(GcError::Listing(e)) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<depot_core::Error> for StoreError {
    fn from(e: depot_core::Error) -> Self {
        StoreError::Config(e.to_string())
    }
}

/// Result type for blob store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Garbage collection errors.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("a collection cycle is already in progress on {0}")]
    CycleInProgress(String),

    #[error("mark phase was started by a different collector")]
    ForeignPhase,

    #[error("invalid mark: {0}")]
    InvalidMark(String),

    #[error("sweep cancelled after {pages} pages")]
    Cancelled { pages: u64 },

    #[error("listing failed: {0}")]
    Listing(#[from] StorageError),
}

/// Result type for garbage collection.
pub type GcResult<T> = std::result::Result<T, GcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = StoreError::Storage(StorageError::S3("connection reset".into()));
        assert!(transient.is_retryable());

        let listing = StoreError::Gc(GcError::Listing(StorageError::S3("throttled".into())));
        assert!(listing.is_retryable());

        let digest = Digest::parse("5d41402abc4b2a76b9719d911017c592").unwrap();
        assert!(!StoreError::NotFound(digest.clone()).is_retryable());
        assert!(
            !StoreError::Integrity {
                digest,
                actual: "00".to_string()
            }
            .is_retryable()
        );
        assert!(!StoreError::Gc(GcError::Cancelled { pages: 3 }).is_retryable());
    }
}
