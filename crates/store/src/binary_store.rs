//! The blob store facade: storage, garbage collection and direct links.

use crate::error::{StoreError, StoreResult};
use crate::file_storage::{FileStorage, StoreOutcome};
use crate::gc::{GarbageCollector, MarkPhase, SweepReport};
use crate::metrics;
use bytes::Bytes;
use depot_core::config::{AppConfig, StorageConfig};
use depot_core::Digest;
use depot_signer::{
    BucketLocator, CdnLinkSigner, DirectLinkSigner, ResponseHeaders, S3LinkSigner,
    SigningCredentials,
};
use depot_storage::backends::s3::normalize_endpoint;
use depot_storage::{ObjectStore, StorageError};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

/// Deletes issued concurrently by [`BinaryStore::remove_all`].
const REMOVAL_CONCURRENCY: usize = 16;

/// Outcome of a best-effort bulk removal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RemovalSummary {
    pub removed: u64,
    /// Already gone when the delete was issued. Counted as success. Backends
    /// that cannot tell (S3) count these as removed.
    pub already_absent: u64,
    pub failed: u64,
}

/// Outcome of a full collection cycle.
#[derive(Clone, Debug, Serialize)]
pub struct GcReport {
    pub sweep: SweepReport,
    /// `None` for a dry run.
    pub removal: Option<RemovalSummary>,
}

/// Content-addressed blob store.
pub struct BinaryStore {
    storage: FileStorage,
    collector: GarbageCollector,
    signer: Option<Arc<dyn DirectLinkSigner>>,
    default_expiry_secs: u64,
}

impl BinaryStore {
    /// Build a store over `backend` without direct download links.
    pub fn new(backend: Arc<dyn ObjectStore>, config: &AppConfig) -> Self {
        let prefix = config.store.normalized_prefix();
        let algorithm = config.store.digest_algorithm;
        Self {
            storage: FileStorage::new(Arc::clone(&backend), &prefix, algorithm),
            collector: GarbageCollector::new(backend, &prefix, algorithm, &config.gc),
            signer: None,
            default_expiry_secs: config.direct_download.expire_secs,
        }
    }

    /// Issue direct download links with `signer`.
    pub fn with_signer(mut self, signer: Arc<dyn DirectLinkSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Build the backend, the optional link signer and the store.
    pub async fn from_config(config: &AppConfig) -> StoreResult<Self> {
        config.validate()?;
        let backend = depot_storage::from_config(&config.storage).await?;
        let store = Self::new(backend, config);

        if !config.direct_download.enabled {
            return Ok(store);
        }
        let signer = build_signer(config)?;
        Ok(store.with_signer(signer))
    }

    pub fn storage(&self) -> &FileStorage {
        &self.storage
    }

    pub fn collector(&self) -> &GarbageCollector {
        &self.collector
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        self.storage.backend()
    }

    pub async fn store(&self, digest: &Digest, content: Bytes) -> StoreResult<StoreOutcome> {
        self.storage.store(digest, content).await
    }

    /// Store `content` under the digest the configured algorithm computes.
    pub async fn store_content(&self, content: Bytes) -> StoreResult<(Digest, StoreOutcome)> {
        let digest = self.storage.algorithm().compute(&content);
        let outcome = self.storage.store(&digest, content).await?;
        Ok((digest, outcome))
    }

    pub async fn fetch(&self, digest: &Digest) -> StoreResult<Bytes> {
        self.storage.fetch(digest).await
    }

    pub async fn contains(&self, digest: &Digest) -> StoreResult<bool> {
        self.storage.contains(digest).await
    }

    pub fn begin_mark_phase(&self) -> StoreResult<MarkPhase> {
        Ok(self.collector.begin_mark_phase()?)
    }

    /// Sweep with `phase`, then delete what it found unless `dry_run`.
    #[instrument(skip(self, phase, cancel), fields(collector = %self.collector.id()))]
    pub async fn collect_garbage(
        &self,
        phase: MarkPhase,
        cancel: &CancellationToken,
        dry_run: bool,
    ) -> StoreResult<GcReport> {
        let sweep = self.collector.sweep(phase, cancel).await?;

        if dry_run {
            tracing::info!(
                collectible = sweep.collectible.len(),
                "Dry run, nothing deleted"
            );
            return Ok(GcReport {
                sweep,
                removal: None,
            });
        }

        let removal = self.remove_all(&sweep.collectible).await;
        Ok(GcReport {
            sweep,
            removal: Some(removal),
        })
    }

    /// Delete every digest, tolerating per-item failures.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn remove_all<'a>(
        &self,
        digests: impl IntoIterator<Item = &'a Digest>,
    ) -> RemovalSummary {
        let backend = self.storage.backend();
        let mut results = futures::stream::iter(digests)
            .map(|digest| {
                let key = self.storage.key_for(digest);
                async move {
                    let result = backend.delete(&key).await;
                    (digest, result)
                }
            })
            .buffer_unordered(REMOVAL_CONCURRENCY);

        let mut summary = RemovalSummary::default();
        while let Some((digest, result)) = results.next().await {
            match result {
                Ok(()) => {
                    tracing::debug!(digest = %digest, "Removed blob");
                    summary.removed += 1;
                }
                Err(StorageError::NotFound(_)) => {
                    tracing::debug!(digest = %digest, "Blob already absent");
                    summary.already_absent += 1;
                }
                Err(e) => {
                    tracing::warn!(digest = %digest, error = %e, "Failed to remove blob");
                    metrics::GC_DELETE_FAILURES.inc();
                    summary.failed += 1;
                }
            }
        }

        metrics::GC_ITEMS_DELETED.inc_by(summary.removed);
        tracing::info!(
            removed = summary.removed,
            already_absent = summary.already_absent,
            failed = summary.failed,
            "Bulk removal finished"
        );
        summary
    }

    /// Signed link for downloading `digest` straight from the backend.
    ///
    /// `expires_in_secs` defaults to the configured link lifetime.
    #[instrument(skip(self, headers), fields(digest = %digest))]
    pub fn direct_url(
        &self,
        digest: &Digest,
        headers: &ResponseHeaders,
        expires_in_secs: Option<u64>,
    ) -> StoreResult<Url> {
        let signer = self
            .signer
            .as_ref()
            .ok_or(StoreError::DirectDownloadDisabled)?;
        let expires_in_secs = expires_in_secs.unwrap_or(self.default_expiry_secs);
        let key = self.storage.key_for(digest);

        match signer.direct_url(&key, headers, expires_in_secs) {
            Ok(url) => {
                metrics::DIRECT_LINKS_ISSUED.inc();
                Ok(url)
            }
            Err(e) => {
                metrics::SIGNING_FAILURES.inc();
                tracing::warn!(key = %key, error = %e, "Failed to sign direct link");
                Err(e.into())
            }
        }
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        Ok(self.backend().health_check().await?)
    }
}

impl std::fmt::Debug for BinaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryStore")
            .field("storage", &self.storage)
            .field("collector", &self.collector)
            .field("direct_download", &self.signer.is_some())
            .field("default_expiry_secs", &self.default_expiry_secs)
            .finish()
    }
}

/// Link signer for an S3 storage configuration, behind a CDN when one is
/// configured.
fn build_signer(config: &AppConfig) -> StoreResult<Arc<dyn DirectLinkSigner>> {
    let StorageConfig::S3 {
        bucket,
        endpoint,
        region,
        access_key_id,
        secret_access_key,
        force_path_style,
        ..
    } = &config.storage
    else {
        return Err(StoreError::Config(format!(
            "direct download requires s3 storage, configured backend is {}",
            config.storage.backend_name()
        )));
    };

    let endpoint = endpoint.as_deref().map(normalize_endpoint);
    let locator = BucketLocator::new(
        bucket.as_str(),
        region.as_deref(),
        endpoint.as_deref(),
        *force_path_style,
    )?;
    let credentials =
        SigningCredentials::resolve(access_key_id.as_deref(), secret_access_key.as_deref())?;
    let signer = S3LinkSigner::new(locator, credentials);

    match &config.direct_download.cdn_host {
        Some(host) => {
            tracing::info!(cdn_host = %host, "Direct download links go through CDN");
            Ok(Arc::new(CdnLinkSigner::new(signer, host)?))
        }
        None => Ok(Arc::new(signer)),
    }
}
