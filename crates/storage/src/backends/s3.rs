//! S3-compatible storage backend using AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::token::{self, BackendIdentity};
use crate::traits::{
    ContentChecksum, ContinuationToken, ListingCapabilities, ListingOptions, ListingPage, ListingResume, ObjectEntry,
    ObjectMeta, ObjectStore, PageStream, StoredObject,
};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::future::ProvideCredentials as ProvideCredentialsFuture;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::DateTime as AwsDateTime;
use aws_sdk_s3::types::ServerSideEncryption;
use bytes::Bytes;
use depot_core::DigestAlgorithm;
use depot_core::config::S3ConnectionConfig;
use std::time::Duration;
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};
use tracing::instrument;

/// Region used when none is configured.
pub const DEFAULT_REGION: &str = "us-east-1";

/// Markers included in lazy-credentials errors so they surface as configuration
/// errors instead of generic S3 transport failures.
const CREDENTIALS_INIT_ERROR_MARKER: &str = "depot-s3-lazy-credentials-init";
const CREDENTIALS_RESOLVE_ERROR_MARKER: &str = "depot-s3-lazy-credentials-resolve";

const HEALTH_CHECK_KEY: &str = ".depot-health-check";

/// Lazily initializes the AWS default credentials chain on first signed request.
#[derive(Debug)]
struct LazyDefaultCredentialsProvider {
    region: String,
    chain: OnceCell<aws_config::default_provider::credentials::DefaultCredentialsChain>,
}

impl LazyDefaultCredentialsProvider {
    fn new(region: String) -> Self {
        Self {
            region,
            chain: OnceCell::new(),
        }
    }

    async fn build_chain(
        &self,
    ) -> Result<aws_config::default_provider::credentials::DefaultCredentialsChain, CredentialsError>
    {
        let region = aws_config::Region::new(self.region.clone());

        tokio::task::spawn(async move {
            aws_config::default_provider::credentials::DefaultCredentialsChain::builder()
                .region(region)
                .build()
                .await
        })
        .await
        .map_err(|join_err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_INIT_ERROR_MARKER}: failed to initialize AWS default credential chain: {join_err}"
            ))
        })
    }

    async fn credentials(&self) -> aws_credential_types::provider::Result {
        let chain = self
            .chain
            .get_or_try_init(|| async { self.build_chain().await })
            .await?;
        chain.provide_credentials().await.map_err(|err| {
            CredentialsError::provider_error(format!(
                "{CREDENTIALS_RESOLVE_ERROR_MARKER}: default AWS credentials resolution failed: {err}"
            ))
        })
    }
}

impl ProvideCredentials for LazyDefaultCredentialsProvider {
    fn provide_credentials<'a>(&'a self) -> ProvideCredentialsFuture<'a>
    where
        Self: 'a,
    {
        ProvideCredentialsFuture::new(self.credentials())
    }
}

fn map_s3_operation_error<E>(err: SdkError<E>) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let err_text = err.to_string();
    if err_text.contains(CREDENTIALS_INIT_ERROR_MARKER)
        || err_text.contains(CREDENTIALS_RESOLVE_ERROR_MARKER)
    {
        return StorageError::Config(
            "S3 credential initialization failed. Configure AWS credentials explicitly or ensure ambient AWS credentials are available."
                .to_string(),
        );
    }

    StorageError::S3(Box::new(err))
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(err, SdkError::ServiceError(service_err) if service_err.raw().status().as_u16() == 404)
}

/// Convert an S3 timestamp. Objects whose timestamp cannot be represented
/// report none and are treated as recent by the collector.
fn to_offset_datetime(key: &str, dt: &AwsDateTime) -> Option<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.secs())
        .inspect_err(|e| {
            tracing::warn!(
                key = %key,
                timestamp = dt.secs(),
                error = %e,
                "Failed to convert S3 timestamp"
            );
        })
        .ok()
}

/// S3-compatible object store using AWS SDK.
pub struct S3Backend {
    client: Client,
    bucket: String,
    /// Normalized endpoint, used for backend identity.
    endpoint: String,
    region: String,
    server_side_encryption: bool,
    max_connections: Option<usize>,
    /// Caps requests in flight at `max_connections`.
    limiter: Option<Semaphore>,
}

impl std::fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Backend")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("server_side_encryption", &self.server_side_encryption)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// Prepend `http://` to bare `host:port` endpoints.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint_lower = endpoint.to_ascii_lowercase();
    if endpoint_lower.starts_with("http://") || endpoint_lower.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    }
}

impl S3Backend {
    /// Create a new S3 backend.
    ///
    /// Explicit credentials must be given as a pair. Without them the AWS
    /// default chain (environment, profile, instance role) is resolved on the
    /// first request. Unset `connection` fields keep the SDK defaults.
    pub async fn new(
        bucket: &str,
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
        force_path_style: bool,
        connection: &S3ConnectionConfig,
    ) -> StorageResult<Self> {
        if access_key_id.is_some() ^ secret_access_key.is_some() {
            return Err(StorageError::Config(
                "s3 config requires both access_key_id and secret_access_key when either is set"
                    .to_string(),
            ));
        }

        let resolved_region = region.unwrap_or_else(|| DEFAULT_REGION.to_string());
        let mut s3_config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(aws_config::Region::new(resolved_region.clone()));

        if let (Some(key_id), Some(secret)) = (access_key_id, secret_access_key) {
            let credentials =
                aws_sdk_s3::config::Credentials::new(key_id, secret, None, None, "depot-config");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        } else {
            s3_config_builder = s3_config_builder
                .credentials_provider(LazyDefaultCredentialsProvider::new(resolved_region.clone()));
        }

        let normalized_endpoint = endpoint.as_deref().map(normalize_endpoint);
        if let Some(endpoint_url) = &normalized_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }
        if force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }
        if let Some(retries) = connection.max_retries {
            s3_config_builder = s3_config_builder
                .retry_config(RetryConfig::standard().with_max_attempts(retries.saturating_add(1)));
        }
        if connection.connect_timeout().is_some() || connection.socket_timeout().is_some() {
            let mut timeouts = TimeoutConfig::builder();
            timeouts
                .set_connect_timeout(connection.connect_timeout())
                .set_read_timeout(connection.socket_timeout());
            s3_config_builder = s3_config_builder.timeout_config(timeouts.build());
        }

        let client = Client::from_conf(s3_config_builder.build());

        let stored_endpoint = match &normalized_endpoint {
            Some(url) => url.clone(),
            None => format!("s3.{}.amazonaws.com", resolved_region),
        };

        Ok(Self {
            client,
            bucket: bucket.to_string(),
            endpoint: stored_endpoint,
            region: resolved_region,
            server_side_encryption: false,
            max_connections: connection.max_connections,
            limiter: connection.max_connections.map(Semaphore::new),
        })
    }

    /// Request SSE-S3 (AES256) encryption for every upload.
    pub fn with_server_side_encryption(mut self, enabled: bool) -> Self {
        self.server_side_encryption = enabled;
        self
    }

    /// Get the backend identity for token envelope validation.
    pub fn backend_identity(&self) -> BackendIdentity {
        BackendIdentity::S3 {
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
            bucket: self.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Wait for a free connection slot, if connections are capped.
    async fn slot(&self) -> StorageResult<Option<SemaphorePermit<'_>>> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        limiter
            .acquire()
            .await
            .map(Some)
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("S3 connection limiter: {e}")))
            })
    }

    /// Convert an AWS SDK error to StorageError, mapping 404 to NotFound.
    fn map_sdk_error<E>(err: SdkError<E>, key: &str) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if is_not_found(&err) {
            return StorageError::NotFound(key.to_string());
        }
        map_s3_operation_error(err)
    }

    fn listing_error<E>(err: SdkError<E>) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        if let SdkError::ServiceError(ref service_err) = err
            && service_err.raw().status().as_u16() == 400
        {
            let body = format!("{:?}", service_err.err());
            if body.contains("continuation") || body.contains("token") {
                return StorageError::InvalidContinuationToken(
                    "S3 rejected continuation token".to_string(),
                );
            }
        }
        map_s3_operation_error(err)
    }

    /// Wrap S3's cursor in an envelope. A cursor that does not fit leaves the
    /// page without a token, which only costs resumability.
    fn wrap_token(
        &self,
        prefix: &str,
        options: &ListingOptions,
        s3_token: &str,
    ) -> Option<ContinuationToken> {
        token::seal(&self.backend_identity(), prefix, options, s3_token)
            .inspect_err(|e| {
                tracing::warn!(
                    error = %e,
                    "Continuation token not representable, listing will not be resumable for this page"
                );
            })
            .ok()
    }

    fn resume_token(
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
impl ObjectStore for S3Backend {
    #[instrument(skip(self), fields(backend = "s3"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let _slot = self.slot().await?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => Err(map_s3_operation_error(err)),
        }
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let _slot = self.slot().await?;
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified: output
                .last_modified()
                .and_then(|dt| to_offset_datetime(key, dt)),
            content_type: output.content_type().map(|s| s.to_string()),
            checksum: output.e_tag().and_then(ContentChecksum::from_etag),
        })
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn get_object(&self, key: &str) -> StorageResult<StoredObject> {
        // Held until the body is drained.
        let _slot = self.slot().await?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error(e, key))?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| to_offset_datetime(key, dt));
        let content_type = output.content_type().map(|s| s.to_string());
        let checksum = output.e_tag().and_then(ContentChecksum::from_etag);

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(Box::new(e)))?
            .into_bytes();

        Ok(StoredObject {
            meta: ObjectMeta {
                size: data.len() as u64,
                last_modified,
                content_type,
                checksum,
            },
            data,
        })
    }

    #[instrument(skip(self, data), fields(backend = "s3", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(data.into());
        if self.server_side_encryption {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }
        let _slot = self.slot().await?;
        request.send().await.map_err(map_s3_operation_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        // DeleteObject succeeds on missing keys; they are reported as removed.
        let _slot = self.slot().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(map_s3_operation_error)?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self), fields(backend = "s3"))]
    async fn health_check(&self) -> StorageResult<()> {
        const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

        let health_check_future = async {
            let _slot = self.slot().await?;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(HEALTH_CHECK_KEY)
                .body(Bytes::from_static(b"health-check").into())
                .send()
                .await
                .map_err(map_s3_operation_error)?;

            match self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(HEALTH_CHECK_KEY)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(map_s3_operation_error(e)),
            }
        };

        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, health_check_future)
            .await
            .map_err(|_| {
                StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "S3 health check timed out after 10 seconds",
                ))
            })?
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        // LastModified is truncated to whole seconds.
        ListingCapabilities {
            timestamp_resolution: time::Duration::SECOND,
        }
    }

    fn checksum_algorithm(&self) -> Option<DigestAlgorithm> {
        // Single-part ETags are the MD5 of the content.
        Some(DigestAlgorithm::Md5)
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let initial_token = match self.resume_token(prefix, &options, resume) {
            Ok(token) => token,
            Err(e) => return Box::pin(futures::stream::once(async move { Err(e) })),
        };

        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let mut continuation_token: Option<String> = initial_token;

            loop {
                let mut request = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .max_keys(page_size as i32);

                if let Some(token) = continuation_token.take() {
                    request = request.continuation_token(token);
                }

                let slot = self.slot().await?;
                let output = request.send().await.map_err(Self::listing_error)?;
                drop(slot);

                let objects: Vec<ObjectEntry> = output
                    .contents()
                    .iter()
                    .filter_map(|obj| {
                        let key = obj.key()?;
                        Some(ObjectEntry {
                            key: key.to_string(),
                            size: obj.size().unwrap_or(0).max(0) as u64,
                            last_modified: obj
                                .last_modified()
                                .and_then(|dt| to_offset_datetime(key, dt)),
                        })
                    })
                    .collect();

                let next_s3_token = if output.is_truncated() == Some(true) {
                    output.next_continuation_token().map(|s| s.to_string())
                } else {
                    None
                };
                let next_token = next_s3_token
                    .as_deref()
                    .and_then(|t| self.wrap_token(&prefix, &options, t));

                let has_more = next_s3_token.is_some();
                if !objects.is_empty() || !has_more {
                    yield ListingPage { objects, next_token };
                }

                if !has_more {
                    break;
                }
                continuation_token = next_s3_token;
            }
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ListingOptions, ListingResume};
    use futures::StreamExt;

    async fn make_backend() -> S3Backend {
        S3Backend::new(
            "test-bucket",
            Some("s3.test".to_string()),
            Some("us-east-1".to_string()),
            Some("access".to_string()),
            Some("secret".to_string()),
            true,
            &S3ConnectionConfig::default(),
        )
        .await
        .expect("backend should construct for unit tests")
    }

    #[tokio::test]
    async fn test_backend_identity_fields() {
        let backend = make_backend().await;
        assert_eq!(
            backend.backend_identity(),
            BackendIdentity::S3 {
                endpoint: "http://s3.test".to_string(),
                region: "us-east-1".to_string(),
                bucket: "test-bucket".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_list_pages_rejects_mismatched_token() {
        let backend = make_backend().await;
        let options = ListingOptions::new(200);
        let mismatched_identity = BackendIdentity::S3 {
            endpoint: "http://other".to_string(),
            region: "us-west-2".to_string(),
            bucket: "other-bucket".to_string(),
        };
        let token = token::seal(&mismatched_identity, "binaries/", &options, "token").unwrap();

        let mut stream = backend.list_pages("binaries/", options, Some(ListingResume::new(token)));
        let result = stream.next().await.unwrap();
        assert!(matches!(
            result,
            Err(StorageError::InvalidContinuationToken(_))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_s3_new_requires_complete_credentials() {
        let err = S3Backend::new(
            "bucket",
            None,
            None,
            Some("access".to_string()),
            None,
            false,
            &S3ConnectionConfig::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Config(_)));
    }

    #[tokio::test]
    async fn test_s3_defaults_region_and_endpoint() {
        let backend =
            S3Backend::new("bucket", None, None, None, None, false, &S3ConnectionConfig::default())
                .await
                .unwrap()
                .with_server_side_encryption(true);

        assert_eq!(backend.region(), DEFAULT_REGION);
        assert_eq!(
            backend.backend_identity(),
            BackendIdentity::S3 {
                endpoint: "s3.us-east-1.amazonaws.com".to_string(),
                region: "us-east-1".to_string(),
                bucket: "bucket".to_string(),
            }
        );
        assert!(format!("{backend:?}").contains("server_side_encryption: true"));
    }

    #[tokio::test]
    async fn test_connection_settings_reach_the_client() {
        let connection = S3ConnectionConfig {
            max_connections: Some(4),
            max_retries: Some(0),
            connect_timeout_ms: Some(1500),
            socket_timeout_ms: Some(20_000),
        };
        let backend = S3Backend::new(
            "bucket",
            Some("minio:9000".to_string()),
            None,
            None,
            None,
            true,
            &connection,
        )
        .await
        .unwrap();

        let config = backend.client.config();
        assert_eq!(config.retry_config().map(|r| r.max_attempts()), Some(1));
        let timeouts = config.timeout_config().unwrap();
        assert_eq!(timeouts.connect_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(timeouts.read_timeout(), Some(Duration::from_secs(20)));
        assert_eq!(backend.limiter.as_ref().map(|l| l.available_permits()), Some(4));

        let slot = backend.slot().await.unwrap();
        assert!(slot.is_some());
        assert_eq!(backend.limiter.as_ref().map(|l| l.available_permits()), Some(3));
    }

    #[tokio::test]
    async fn test_unlimited_connections_skip_the_limiter() {
        let backend = make_backend().await;
        assert!(backend.slot().await.unwrap().is_none());
        assert_eq!(
            backend.listing_capabilities().timestamp_resolution,
            time::Duration::SECOND
        );
        assert_eq!(backend.checksum_algorithm(), Some(DigestAlgorithm::Md5));
    }

    #[test]
    fn test_normalize_endpoint() {
        assert_eq!(normalize_endpoint("minio:9000"), "http://minio:9000");
        assert_eq!(normalize_endpoint("https://s3.example.com/"), "https://s3.example.com");
        assert_eq!(normalize_endpoint("HTTP://minio:9000"), "HTTP://minio:9000");
    }
}
