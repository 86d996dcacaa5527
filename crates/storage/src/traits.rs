//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use depot_core::DigestAlgorithm;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// A boxed stream of listing pages.
pub type PageStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ListingPage>> + Send + 'a>>;

/// A boxed stream of listed objects.
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<ObjectEntry>> + Send + 'a>>;

// ===== Streaming Listing API Types =====

/// Page size constraints for listing operations.
///
/// The upper bound is the largest page ListObjectsV2 returns.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Maximum size for continuation tokens (2 KB).
pub const MAX_TOKEN_SIZE: usize = 2048;

/// An opaque continuation token for resuming listing operations.
///
/// This token is backend-specific and should not be parsed or modified.
/// Maximum size is 2 KB.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken(Vec<u8>);

impl ContinuationToken {
    /// Create a new continuation token from raw bytes.
    ///
    /// Returns an error if the token exceeds MAX_TOKEN_SIZE.
    pub fn new(data: Vec<u8>) -> StorageResult<Self> {
        if data.len() > MAX_TOKEN_SIZE {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token too large: {} bytes (max: {})",
                data.len(),
                MAX_TOKEN_SIZE
            )));
        }
        Ok(Self(data))
    }

    /// Get the raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Convert to base64 for display or transport.
    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.0)
    }

    /// Parse from base64.
    pub fn from_base64(s: &str) -> StorageResult<Self> {
        // Reject before decoding; 4/3 expansion plus padding stays under 2x.
        const MAX_BASE64_INPUT: usize = MAX_TOKEN_SIZE * 2;
        if s.len() > MAX_BASE64_INPUT {
            return Err(StorageError::InvalidContinuationToken(format!(
                "continuation token base64 too large: {} bytes (max: {})",
                s.len(),
                MAX_BASE64_INPUT
            )));
        }

        let data = general_purpose::STANDARD.decode(s).map_err(|e| {
            StorageError::InvalidContinuationToken(format!(
                "invalid continuation token base64: {}",
                e
            ))
        })?;
        Self::new(data)
    }
}

impl std::fmt::Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContinuationToken")
            .field(&"<redacted>")
            .finish()
    }
}

/// One object as reported by a listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Full object key, including the listing prefix.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time, when the backend reports one.
    pub last_modified: Option<time::OffsetDateTime>,
}

/// A single page of listing results.
///
/// Contains a batch of objects and an optional continuation token
/// for fetching the next page.
#[derive(Clone, Debug)]
pub struct ListingPage {
    /// Objects in this page.
    pub objects: Vec<ObjectEntry>,

    /// Continuation token for the next page, if there are more results.
    /// If None, this is the last page.
    pub next_token: Option<ContinuationToken>,
}

impl ListingPage {
    /// Keys of the objects in this page.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.objects.iter().map(|o| o.key.as_str())
    }
}

/// Backend capabilities for listing operations.
#[derive(Clone, Debug)]
pub struct ListingCapabilities {
    /// Granularity of the `last_modified` times this backend reports.
    ///
    /// A reported time may be up to this much earlier than the actual write.
    /// Zero means exact.
    pub timestamp_resolution: time::Duration,
}

/// Options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingOptions {
    /// Number of keys to fetch per page.
    ///
    /// This value will be clamped to [MIN_PAGE_SIZE, MAX_PAGE_SIZE].
    pub page_size: usize,
}

impl ListingOptions {
    /// Create new listing options with the given page size.
    pub fn new(page_size: usize) -> Self {
        Self { page_size }
    }

    /// Get the normalized page size.
    pub fn normalized_page_size(&self) -> usize {
        self.page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
    }
}

impl Default for ListingOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Resume options for listing operations.
#[derive(Clone, Debug)]
pub struct ListingResume {
    /// Continuation token from a previous listing operation.
    ///
    /// The backend validates that the token was issued for the same backend,
    /// prefix and page size.
    pub start_token: ContinuationToken,
}

impl ListingResume {
    /// Create new resume options with the given token.
    pub fn new(start_token: ContinuationToken) -> Self {
        Self { start_token }
    }
}

/// Content hash recorded by the backend for a stored object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentChecksum {
    /// Lowercase or uppercase hex, as in an S3 ETag.
    Hex(String),
    /// Standard base64, as in a Content-MD5 header.
    Base64(String),
}

impl ContentChecksum {
    /// Build a checksum from an S3 ETag.
    ///
    /// Quotes are stripped. Multipart ETags (`<hex>-<parts>`) do not hash the
    /// content and yield `None`.
    pub fn from_etag(etag: &str) -> Option<Self> {
        let etag = etag.trim().trim_matches('"');
        if etag.is_empty() || etag.contains('-') {
            return None;
        }
        Some(Self::Hex(etag.to_string()))
    }

    /// Content-MD5 style checksum of `data`.
    pub fn md5_base64(data: &[u8]) -> Self {
        Self::Base64(general_purpose::STANDARD.encode(md5::compute(data).0))
    }

    /// Decode into raw hash bytes.
    pub fn decode(&self) -> StorageResult<Vec<u8>> {
        match self {
            Self::Hex(s) => hex::decode(s)
                .map_err(|e| StorageError::InvalidChecksum(format!("{s:?}: {e}"))),
            Self::Base64(s) => general_purpose::STANDARD
                .decode(s)
                .map_err(|e| StorageError::InvalidChecksum(format!("{s:?}: {e}"))),
        }
    }
}

impl std::fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hex(s) => write!(f, "hex:{s}"),
            Self::Base64(s) => write!(f, "base64:{s}"),
        }
    }
}

/// Metadata about a stored object.
#[derive(Clone, Debug)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time (if available).
    pub last_modified: Option<time::OffsetDateTime>,
    /// Content type (if available).
    pub content_type: Option<String>,
    /// Backend-recorded content hash (if available).
    pub checksum: Option<ContentChecksum>,
}

/// An object's bytes together with its metadata.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub data: Bytes,
    pub meta: ObjectMeta,
}

/// Object store abstraction for content-addressed storage.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Check if an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get an object's metadata without fetching content.
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta>;

    /// Get an object's content.
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        Ok(self.get_object(key).await?.data)
    }

    /// Get an object's content and the metadata returned alongside it.
    async fn get_object(&self, key: &str) -> StorageResult<StoredObject>;

    /// Put an object, replacing any existing object under the same key.
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object.
    ///
    /// Backends that can tell return `NotFound` for a missing key. Others
    /// (S3) report success either way.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Get the name of this storage backend.
    ///
    /// Returns a static string identifier for the backend type (e.g., "s3", "filesystem").
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Get the listing capabilities of this backend.
    fn listing_capabilities(&self) -> ListingCapabilities;

    /// Hash algorithm behind the `checksum` in [`ObjectMeta`], if the backend
    /// records one.
    fn checksum_algorithm(&self) -> Option<DigestAlgorithm> {
        None
    }

    /// List objects with a prefix, returning a stream of pages.
    ///
    /// Each page contains a batch of objects and an optional continuation token
    /// for fetching the next page. The stream ends after the page whose token
    /// is `None`. Restarting without a token is always safe.
    ///
    /// # Errors
    ///
    /// The stream yields an error if:
    /// - The continuation token is invalid or belongs to another listing
    /// - There is a backend-specific error fetching the listing
    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a>;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification (e.g., local filesystem).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

// ===== Extension Trait =====

/// Extension trait providing a flat object stream over list_pages().
///
/// Automatically implemented for every ObjectStore. Do not implement it
/// manually.
pub trait ObjectStoreListStreamExt: ObjectStore {
    /// List objects with a prefix, returning a flat stream of entries.
    ///
    /// Objects are yielded in the order they appear in the backend's listing
    /// (which may not be lexicographic).
    fn list_objects_ext<'a>(
        &'a self,
        prefix: &str,
        options: Option<ListingOptions>,
    ) -> EntryStream<'a> {
        let options = options.unwrap_or_default();
        let page_stream = self.list_pages(prefix, options, None);

        let entry_stream = page_stream.flat_map(|page_result| match page_result {
            Ok(page) => futures::stream::iter(page.objects.into_iter().map(Ok)).boxed(),
            Err(e) => futures::stream::once(async move { Err(e) }).boxed(),
        });

        Box::pin(entry_stream)
    }
}

impl<T: ObjectStore + ?Sized> ObjectStoreListStreamExt for T {}
