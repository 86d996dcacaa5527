//! Single-use listing contexts over a borrowed backend.

use crate::traits::{
    EntryStream, ListingOptions, ListingResume, ObjectStore, PageStream,
};
use futures::StreamExt;

/// A listing of one prefix, bound to a borrowed ObjectStore.
///
/// Consumed by [`stream`](Self::stream) or [`stream_pages`](Self::stream_pages).
/// Both streams are lazy: a page is only requested from the backend once the
/// previous one has been consumed, and the stream ends after the last page.
pub struct ListingContext<'a> {
    store: &'a dyn ObjectStore,
    prefix: String,
    options: ListingOptions,
    resume: Option<ListingResume>,
}

impl<'a> ListingContext<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        prefix: impl Into<String>,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            options,
            resume,
        }
    }

    /// Stream individual objects, hiding page boundaries.
    pub fn stream(self) -> EntryStream<'a> {
        let mut page_stream = self
            .store
            .list_pages(&self.prefix, self.options, self.resume);

        let stream = async_stream::try_stream! {
            while let Some(page_result) = page_stream.next().await {
                let page = page_result?;
                for entry in page.objects {
                    yield entry;
                }
            }
        };

        Box::pin(stream)
    }

    /// Stream whole pages, exposing continuation tokens for checkpointing.
    pub fn stream_pages(self) -> PageStream<'a> {
        self.store
            .list_pages(&self.prefix, self.options, self.resume)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn options(&self) -> &ListingOptions {
        &self.options
    }
}
