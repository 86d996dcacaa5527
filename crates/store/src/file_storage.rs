//! Digest-keyed reads and writes with integrity checks.

use crate::error::{StoreError, StoreResult};
use crate::metrics;
use bytes::Bytes;
use depot_core::config::normalize_prefix;
use depot_core::{Digest, DigestAlgorithm};
use depot_storage::{ContentChecksum, ObjectStore, StorageError};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;

/// What [`FileStorage::store`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOutcome {
    /// The blob was missing and has been uploaded.
    Stored,
    /// An object already existed under the digest; nothing was written.
    AlreadyPresent,
    /// An object existed but its checksum disagreed with the digest, so it
    /// was overwritten.
    Repaired,
}

impl StoreOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::AlreadyPresent => "already_present",
            Self::Repaired => "repaired",
        }
    }
}

/// Result of comparing a backend checksum with a digest.
#[derive(Debug, PartialEq, Eq)]
enum ChecksumCheck {
    Match,
    /// Absent, or the backend hashes with another algorithm.
    NotComparable,
    Mismatch { actual: String },
}

/// Compare the checksum a backend hashing with `backend_algorithm` reported.
///
/// Once the algorithms agree, anything but the digest's own bytes is a
/// mismatch, including checksums that do not decode or have the wrong length.
fn check_checksum(
    digest: &Digest,
    checksum: Option<&ContentChecksum>,
    backend_algorithm: Option<DigestAlgorithm>,
) -> ChecksumCheck {
    let Some(checksum) = checksum else {
        return ChecksumCheck::NotComparable;
    };
    if backend_algorithm != Some(digest.algorithm()) {
        return ChecksumCheck::NotComparable;
    }
    match checksum.decode() {
        Ok(bytes) if bytes == digest.to_bytes() => ChecksumCheck::Match,
        Ok(bytes) => ChecksumCheck::Mismatch {
            actual: hex::encode(bytes),
        },
        Err(_) => ChecksumCheck::Mismatch {
            actual: checksum.to_string(),
        },
    }
}

/// Stores blobs under `prefix + digest` in an object store.
#[derive(Clone)]
pub struct FileStorage {
    backend: Arc<dyn ObjectStore>,
    prefix: String,
    algorithm: DigestAlgorithm,
}

impl FileStorage {
    pub fn new(backend: Arc<dyn ObjectStore>, prefix: &str, algorithm: DigestAlgorithm) -> Self {
        Self {
            backend,
            prefix: normalize_prefix(prefix),
            algorithm,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.backend
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Object key of a blob.
    pub fn key_for(&self, digest: &Digest) -> String {
        format!("{}{}", self.prefix, digest)
    }

    /// Digest named by an object key, if the key is a blob of this store.
    pub fn digest_for_key(&self, key: &str) -> Option<Digest> {
        let name = key.strip_prefix(&self.prefix)?;
        Digest::parse_as(name, self.algorithm).ok()
    }

    fn check(&self, digest: &Digest, checksum: Option<&ContentChecksum>) -> ChecksumCheck {
        check_checksum(digest, checksum, self.backend.checksum_algorithm())
    }

    fn check_algorithm(&self, digest: &Digest) -> StoreResult<()> {
        if digest.algorithm() != self.algorithm {
            return Err(StoreError::AlgorithmMismatch {
                digest: digest.clone(),
                expected: self.algorithm,
            });
        }
        Ok(())
    }

    /// Upload `content` under `digest` unless an intact copy already exists.
    ///
    /// The content is not hashed: callers are trusted to pass the digest of
    /// the bytes they hand over.
    #[instrument(skip(self, content), fields(digest = %digest, size = content.len()))]
    pub async fn store(&self, digest: &Digest, content: Bytes) -> StoreResult<StoreOutcome> {
        self.check_algorithm(digest)?;
        let key = self.key_for(digest);

        let outcome = match self.backend.head(&key).await {
            Ok(meta) => match self.check(digest, meta.checksum.as_ref()) {
                ChecksumCheck::Match | ChecksumCheck::NotComparable => {
                    tracing::debug!(key = %key, "Blob already present, skipping upload");
                    metrics::BLOBS_DEDUPLICATED.inc();
                    return Ok(StoreOutcome::AlreadyPresent);
                }
                ChecksumCheck::Mismatch { actual } => {
                    tracing::warn!(
                        key = %key,
                        actual = %actual,
                        "Existing object does not match its digest, uploading again"
                    );
                    StoreOutcome::Repaired
                }
            },
            Err(StorageError::NotFound(_)) => StoreOutcome::Stored,
            Err(e) => return Err(e.into()),
        };

        let size = content.len() as u64;
        self.backend.put(&key, content).await?;

        metrics::BLOBS_STORED.inc();
        metrics::BYTES_STORED.inc_by(size);
        if outcome == StoreOutcome::Repaired {
            metrics::BLOBS_REPAIRED.inc();
        }
        tracing::info!(key = %key, outcome = outcome.as_str(), "Stored blob");
        Ok(outcome)
    }

    /// Download a blob and check it against its digest.
    ///
    /// Uses the backend checksum when it was produced by the digest's
    /// algorithm, and hashes the bytes otherwise. Content that fails the check
    /// is never returned.
    #[instrument(skip(self), fields(digest = %digest))]
    pub async fn fetch(&self, digest: &Digest) -> StoreResult<Bytes> {
        let key = self.key_for(digest);
        let object = match self.backend.get_object(&key).await {
            Ok(object) => object,
            Err(StorageError::NotFound(_)) => return Err(StoreError::NotFound(digest.clone())),
            Err(e) => return Err(e.into()),
        };

        let mismatch = match self.check(digest, object.meta.checksum.as_ref()) {
            ChecksumCheck::Match => None,
            ChecksumCheck::Mismatch { actual } => Some(actual),
            ChecksumCheck::NotComparable => {
                let computed = digest.algorithm().compute(&object.data);
                (computed != *digest).then(|| computed.into_string())
            }
        };

        if let Some(actual) = mismatch {
            metrics::INTEGRITY_FAILURES.inc();
            tracing::warn!(key = %key, actual = %actual, "Blob failed integrity check");
            return Err(StoreError::Integrity {
                digest: digest.clone(),
                actual,
            });
        }

        tracing::debug!(key = %key, size = object.data.len(), "Fetched blob");
        Ok(object.data)
    }

    /// Whether an object exists under `digest`.
    pub async fn contains(&self, digest: &Digest) -> StoreResult<bool> {
        Ok(self.backend.exists(&self.key_for(digest)).await?)
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("backend", &self.backend.backend_name())
            .field("prefix", &self.prefix)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_storage::MemoryBackend;

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn hello() -> Digest {
        Digest::parse(HELLO_MD5).unwrap()
    }

    fn storage() -> (Arc<MemoryBackend>, FileStorage) {
        let backend = Arc::new(MemoryBackend::new());
        let storage = FileStorage::new(backend.clone(), "binaries", DigestAlgorithm::Md5);
        (backend, storage)
    }

    #[test]
    fn test_checksum_comparison() {
        let digest = hello();
        let md5 = Some(DigestAlgorithm::Md5);
        let check = |checksum: ContentChecksum| check_checksum(&digest, Some(&checksum), md5);

        assert_eq!(check_checksum(&digest, None, md5), ChecksumCheck::NotComparable);
        assert_eq!(check(ContentChecksum::Hex(HELLO_MD5.to_string())), ChecksumCheck::Match);
        assert_eq!(check(ContentChecksum::md5_base64(b"hello")), ChecksumCheck::Match);
        assert_eq!(
            check(ContentChecksum::Hex("00".repeat(16))),
            ChecksumCheck::Mismatch {
                actual: "00".repeat(16)
            }
        );
        // Same algorithm, so malformed values are corruption too.
        for garbage in [
            ContentChecksum::Hex("ab".repeat(32)),
            ContentChecksum::Hex("zz".repeat(16)),
            ContentChecksum::Hex(format!("{HELLO_MD5}0")),
            ContentChecksum::Base64("XUFAKrxLKna5cZ2REBfFkgAA".to_string()),
            ContentChecksum::Base64("not base64!".to_string()),
        ] {
            assert!(
                matches!(check(garbage.clone()), ChecksumCheck::Mismatch { .. }),
                "{garbage}"
            );
        }
    }

    #[test]
    fn test_checksum_of_other_algorithm_is_not_comparable() {
        let sha = DigestAlgorithm::Sha256.compute(b"hello");
        let etag = ContentChecksum::Hex(HELLO_MD5.to_string());

        assert_eq!(
            check_checksum(&sha, Some(&etag), Some(DigestAlgorithm::Md5)),
            ChecksumCheck::NotComparable
        );
        assert_eq!(
            check_checksum(&hello(), Some(&etag), None),
            ChecksumCheck::NotComparable
        );
    }

    #[test]
    fn test_keys_and_prefix() {
        let (_, storage) = storage();
        assert_eq!(storage.prefix(), "binaries/");
        assert_eq!(storage.key_for(&hello()), format!("binaries/{HELLO_MD5}"));
        assert_eq!(
            storage.digest_for_key(&format!("binaries/{HELLO_MD5}")),
            Some(hello())
        );
        assert_eq!(storage.digest_for_key(&format!("other/{HELLO_MD5}")), None);
        assert_eq!(storage.digest_for_key("binaries/readme.txt"), None);
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let (backend, storage) = storage();
        let content = Bytes::from_static(b"hello");

        assert_eq!(
            storage.store(&hello(), content.clone()).await.unwrap(),
            StoreOutcome::Stored
        );
        assert_eq!(
            storage.store(&hello(), content).await.unwrap(),
            StoreOutcome::AlreadyPresent
        );
        assert_eq!(backend.len().await, 1);
        assert_eq!(storage.fetch(&hello()).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_store_rejects_other_algorithm() {
        let (_, storage) = storage();
        let sha = DigestAlgorithm::Sha256.compute(b"hello");
        assert!(matches!(
            storage.store(&sha, Bytes::from_static(b"hello")).await,
            Err(StoreError::AlgorithmMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_missing_is_not_found() {
        let (_, storage) = storage();
        assert!(matches!(
            storage.fetch(&hello()).await,
            Err(StoreError::NotFound(d)) if d == hello()
        ));
        assert!(!storage.contains(&hello()).await.unwrap());
    }
}
