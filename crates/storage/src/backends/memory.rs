//! In-process storage backend.
//!
//! Objects live in an ordered map, so listings are lexicographic and
//! resumable from the last key of a page. Each put records the Content-MD5 of
//! the data in base64, like an HTTP object store would.

use crate::error::{StorageError, StorageResult};
use crate::token::{self, BackendIdentity};
use crate::traits::{
    ContentChecksum, ContinuationToken, ListingCapabilities, ListingOptions, ListingPage,
    ListingResume, ObjectEntry, ObjectMeta, ObjectStore, PageStream, StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use depot_core::DigestAlgorithm;
use std::collections::BTreeMap;
use std::ops::Bound;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct MemoryObject {
    data: Bytes,
    checksum: Option<ContentChecksum>,
    last_modified: OffsetDateTime,
}

impl MemoryObject {
    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            size: self.data.len() as u64,
            last_modified: Some(self.last_modified),
            content_type: None,
            checksum: self.checksum.clone(),
        }
    }
}

/// In-memory object store.
#[derive(Debug)]
pub struct MemoryBackend {
    instance: String,
    whole_seconds: bool,
    objects: RwLock<BTreeMap<String, MemoryObject>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            instance: Uuid::new_v4().to_string(),
            whole_seconds: false,
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record modification times truncated to the second, as S3 reports them.
    pub fn with_whole_second_timestamps(mut self) -> Self {
        self.whole_seconds = true;
        self
    }

    pub fn backend_identity(&self) -> BackendIdentity {
        BackendIdentity::Memory {
            instance: self.instance.clone(),
        }
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Overwrite the recorded checksum of an object.
    ///
    /// Simulates a backend reporting a hash that does not match the stored
    /// bytes, or not reporting one at all.
    pub async fn set_checksum(
        &self,
        key: &str,
        checksum: Option<ContentChecksum>,
    ) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.checksum = checksum;
        Ok(())
    }

    /// Overwrite the modification time of an object.
    pub async fn set_last_modified(
        &self,
        key: &str,
        last_modified: OffsetDateTime,
    ) -> StorageResult<()> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.last_modified = last_modified;
        Ok(())
    }

    /// Collect the page of up to `page_size` keys after `after`.
    async fn page_after(
        &self,
        prefix: &str,
        after: Option<&str>,
        page_size: usize,
    ) -> (Vec<ObjectEntry>, bool) {
        let objects = self.objects.read().await;
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut matching = objects
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectEntry {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
            });

        let page: Vec<ObjectEntry> = matching.by_ref().take(page_size).collect();
        let has_more = matching.next().is_some();
        (page, has_more)
    }

    fn next_token(
        &self,
        prefix: &str,
        options: &ListingOptions,
        last_key: &str,
    ) -> StorageResult<ContinuationToken> {
        token::seal(&self.backend_identity(), prefix, options, last_key)
    }

    fn resume_after(
        &self,
        prefix: &str,
        options: &ListingOptions,
        resume: Option<ListingResume>,
    ) -> StorageResult<Option<String>> {
        let Some(resume) = resume else {
            return Ok(None);
        };
        token::open(&resume.start_token, &self.backend_identity(), prefix, options).map(Some)
    }
}

#[async_trait]
impl ObjectStore for MemoryBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.objects
            .read()
            .await
            .get(key)
            .map(MemoryObject::meta)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn get_object(&self, key: &str) -> StorageResult<StoredObject> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| StoredObject {
                data: object.data.clone(),
                meta: object.meta(),
            })
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("empty key".to_string()));
        }
        let mut last_modified = OffsetDateTime::now_utc();
        if self.whole_seconds {
            last_modified = last_modified.replace_nanosecond(0).unwrap_or(last_modified);
        }
        let object = MemoryObject {
            checksum: Some(ContentChecksum::md5_base64(&data)),
            data,
            last_modified,
        };
        self.objects.write().await.insert(key.to_string(), object);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        ListingCapabilities {
            timestamp_resolution: if self.whole_seconds {
                Duration::SECOND
            } else {
                Duration::ZERO
            },
        }
    }

    fn checksum_algorithm(&self) -> Option<DigestAlgorithm> {
        Some(DigestAlgorithm::Md5)
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let initial_after = match self.resume_after(prefix, &options, resume) {
            Ok(after) => after,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(e) })),
        };

        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let mut after = initial_after;
            loop {
                let (objects, has_more) = self
                    .page_after(&prefix, after.as_deref(), page_size)
                    .await;

                let next_token = match (has_more, objects.last()) {
                    (true, Some(last)) => Some(self.next_token(&prefix, &options, &last.key)?),
                    _ => None,
                };
                after = objects.last().map(|o| o.key.clone());

                yield ListingPage { objects, next_token };

                if !has_more {
                    break;
                }
            }
        };

        Box::pin(stream)
    }
}
