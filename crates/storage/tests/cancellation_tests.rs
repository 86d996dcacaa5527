// Dropping a listing stream must stop the backend from producing further pages.

mod common;

use common::InstrumentedBackend;
use depot_storage::ListingContext;
use depot_storage::traits::{ListingOptions, ObjectStore};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use tokio::time::Duration;

#[tokio::test]
async fn test_stream_drop_stops_pagination() {
    let page_size = 100;
    let total_keys = 10_000;
    let keys_to_read = 250;

    let (backend, pages_fetched) = InstrumentedBackend::new(total_keys);

    let mut stream = ListingContext::new(
        backend.as_ref(),
        "binaries/",
        ListingOptions::new(page_size),
        None,
    )
    .stream();

    let mut count = 0;
    while let Some(entry) = stream.next().await {
        entry.unwrap();
        count += 1;
        if count >= keys_to_read {
            break;
        }
    }
    drop(stream);

    tokio::time::sleep(Duration::from_millis(50)).await;

    let fetched = pages_fetched.load(Ordering::SeqCst);
    // 250 keys at 100 per page is 3 pages; allow one more for scheduling.
    assert!(
        fetched <= 4,
        "Expected <= 4 pages fetched after cancellation, got {}",
        fetched
    );
}

#[tokio::test]
async fn test_early_return_from_stream() -> depot_storage::StorageResult<()> {
    let (backend, pages_fetched) = InstrumentedBackend::new(5000);

    async fn process_limited(
        backend: std::sync::Arc<InstrumentedBackend>,
    ) -> depot_storage::StorageResult<usize> {
        let mut stream = backend.list_pages("", ListingOptions::new(100), None);
        let mut count = 0;

        while let Some(page) = stream.next().await {
            count += page?.objects.len();
            if count >= 150 {
                return Ok(count);
            }
        }
        Ok(count)
    }

    let count = process_limited(backend.clone()).await?;
    assert_eq!(count, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let fetched = pages_fetched.load(Ordering::SeqCst);
    assert!(
        fetched <= 3,
        "Expected <= 3 pages after early return, got {}",
        fetched
    );

    Ok(())
}

#[tokio::test]
async fn test_slow_consumer_does_not_overfetch() {
    let (backend, pages_fetched) = InstrumentedBackend::new(10_000);

    let mut stream = backend.list_pages("", ListingOptions::new(100), None);
    for _ in 0..5 {
        if let Some(page) = stream.next().await {
            page.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    let fetched = pages_fetched.load(Ordering::SeqCst);
    assert!(
        fetched <= 6,
        "fetched {} pages when only 5 were consumed",
        fetched
    );
}
