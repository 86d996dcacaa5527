use async_trait::async_trait;
use bytes::Bytes;
use depot_core::DigestAlgorithm;
use depot_storage::error::{StorageError, StorageResult};
use depot_storage::traits::{
    ListingCapabilities, ListingOptions, ListingResume, ObjectMeta, ObjectStore, PageStream,
    StoredObject,
};
use depot_storage::MemoryBackend;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Memory backend with injectable faults.
#[allow(dead_code)]
#[derive(Default)]
pub struct FlakyBackend {
    pub inner: MemoryBackend,
    failing_deletes: Mutex<HashSet<String>>,
    fail_listing_after: Option<usize>,
    cancel_after: Option<(usize, CancellationToken)>,
}

#[allow(dead_code)]
impl FlakyBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make deletes of `key` fail with a transient error.
    pub fn fail_delete(&self, key: impl Into<String>) {
        self.failing_deletes
            .lock()
            .unwrap()
            .insert(key.into());
    }

    /// Fail the listing once `pages` pages have been produced.
    pub fn with_listing_failure_after(mut self, pages: usize) -> Self {
        self.fail_listing_after = Some(pages);
        self
    }

    /// Cancel `token` while producing page number `pages`.
    pub fn with_cancel_after(mut self, pages: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((pages, token));
        self
    }
}

#[async_trait]
impl ObjectStore for FlakyBackend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        self.inner.exists(key).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.inner.head(key).await
    }

    async fn get_object(&self, key: &str) -> StorageResult<StoredObject> {
        self.inner.get_object(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if self.failing_deletes.lock().unwrap().contains(key) {
            return Err(StorageError::S3("injected delete failure".into()));
        }
        self.inner.delete(key).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        self.inner.listing_capabilities()
    }

    fn checksum_algorithm(&self) -> Option<DigestAlgorithm> {
        self.inner.checksum_algorithm()
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let fail_after = self.fail_listing_after;
        let cancel_after = self.cancel_after.clone();

        let pages = self
            .inner
            .list_pages(prefix, options, resume)
            .enumerate()
            .map(move |(index, page)| {
                let produced = index + 1;
                if let Some((at, token)) = &cancel_after
                    && produced == *at
                {
                    token.cancel();
                }
                match fail_after {
                    Some(limit) if index >= limit => {
                        Err(StorageError::S3("injected listing failure".into()))
                    }
                    _ => page,
                }
            });

        Box::pin(pages)
    }
}
