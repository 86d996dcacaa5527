use async_trait::async_trait;
use bytes::Bytes;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{
    ContinuationToken, ListingCapabilities, ListingOptions, ListingPage, ListingResume,
    ObjectEntry, ObjectMeta, ObjectStore, PageStream, StoredObject,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Duration;

/// Read-only backend that synthesizes `total_keys` digest-named objects on the
/// fly and counts every page it produces.
#[allow(dead_code)]
pub struct InstrumentedBackend {
    pub total_keys: usize,
    pub pages_fetched: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl InstrumentedBackend {
    pub fn new(total_keys: usize) -> (Arc<Self>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let backend = Arc::new(Self {
            total_keys,
            pages_fetched: counter.clone(),
        });
        (backend, counter)
    }

    pub fn key(i: usize) -> String {
        format!("binaries/{:032x}", i)
    }
}

#[async_trait]
impl ObjectStore for InstrumentedBackend {
    async fn exists(&self, _key: &str) -> StorageResult<bool> {
        Ok(false)
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn get_object(&self, key: &str) -> StorageResult<StoredObject> {
        Err(StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, _key: &str, _data: Bytes) -> StorageResult<()> {
        Err(StorageError::InvalidKey(
            "instrumented backend is read-only".to_string(),
        ))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Err(StorageError::NotFound(key.to_string()))
    }

    fn backend_name(&self) -> &'static str {
        "instrumented"
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        ListingCapabilities {
            timestamp_resolution: time::Duration::ZERO,
        }
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let page_size = options.normalized_page_size();
        let prefix = prefix.to_string();
        let pages_counter = self.pages_fetched.clone();

        // Tokens are the decimal index of the next key.
        let start_index = resume
            .and_then(|r| String::from_utf8(r.start_token.as_bytes().to_vec()).ok())
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);

        let total_keys = self.total_keys;

        Box::pin(async_stream::try_stream! {
            let mut index = start_index;
            while index < total_keys {
                // Count before yielding so a dropped consumer is visible.
                pages_counter.fetch_add(1, Ordering::SeqCst);

                let end = (index + page_size).min(total_keys);
                let objects: Vec<ObjectEntry> = (index..end)
                    .map(Self::key)
                    .filter(|key| key.starts_with(&prefix))
                    .map(|key| ObjectEntry { key, size: 1, last_modified: None })
                    .collect();

                let next_token = if end < total_keys {
                    Some(ContinuationToken::new(end.to_string().into_bytes())?)
                } else {
                    None
                };

                yield ListingPage { objects, next_token };

                index = end;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }
}
