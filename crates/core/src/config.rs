//! Configuration types shared across crates.

use crate::digest::DigestAlgorithm;
use crate::{MAX_LINK_EXPIRY_SECS, MAX_LISTING_PAGE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use time::Duration;

/// Storage backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region. Defaults to us-east-1.
        region: Option<String>,
        /// AWS access key ID. Falls back to AWS_ACCESS_KEY_ID env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        access_key_id: Option<String>,
        /// AWS secret access key. Falls back to AWS_SECRET_ACCESS_KEY env var if not set.
        /// WARNING: Prefer env vars or IAM roles over storing secrets in config files.
        secret_access_key: Option<String>,
        /// Force path-style URLs (e.g., `endpoint/bucket/key` instead of `bucket.endpoint/key`).
        /// Required for MinIO and some S3-compatible services.
        #[serde(default)]
        force_path_style: bool,
        /// Request SSE-S3 (AES256) server-side encryption on upload.
        /// SSE-S3 keeps the ETag equal to the MD5 of the content.
        #[serde(default)]
        server_side_encryption: bool,
        /// HTTP client limits. Unset values keep the SDK defaults.
        #[serde(default)]
        connection: S3ConnectionConfig,
    },
    /// In-process storage, lost on exit. Intended for tests.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/blobs"),
        }
    }
}

/// S3 client connection settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3ConnectionConfig {
    /// Maximum number of requests in flight at once.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// Retries after the first attempt, with exponential backoff.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Time allowed to establish a connection, in milliseconds.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
    /// Time allowed between bytes of a response, in milliseconds.
    #[serde(default)]
    pub socket_timeout_ms: Option<u64>,
}

impl S3ConnectionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == Some(0) {
            return Err("storage.connection.max_connections must be at least 1".to_string());
        }
        for (name, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("socket_timeout_ms", self.socket_timeout_ms),
        ] {
            if value == Some(0) {
                return Err(format!("storage.connection.{name} must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<std::time::Duration> {
        self.connect_timeout_ms.map(std::time::Duration::from_millis)
    }

    pub fn socket_timeout(&self) -> Option<std::time::Duration> {
        self.socket_timeout_ms.map(std::time::Duration::from_millis)
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::S3 {
                bucket,
                access_key_id,
                secret_access_key,
                connection,
                ..
            } => {
                if bucket.trim().is_empty() {
                    return Err("s3 config requires a bucket".to_string());
                }
                connection.validate()?;
                match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                    (Some(_), Some(_)) | (None, None) => Ok(()),
                    _ => Err(
                        "s3 config requires both access_key_id and secret_access_key when either is set"
                            .to_string(),
                    ),
                }
            }
            _ => Ok(()),
        }
    }

    /// Short backend name used in collector identifiers and logs.
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Filesystem { .. } => "filesystem",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::Memory => "memory",
        }
    }
}

/// Blob store layout configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Key prefix under which blobs are stored. A trailing `/` is added
    /// when missing.
    #[serde(default)]
    pub prefix: String,
    /// Digest algorithm blobs are keyed by.
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
}

impl StoreConfig {
    /// The prefix with a trailing `/`, or empty.
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

/// Append a trailing `/` to a non-empty prefix that lacks one.
pub fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_start_matches('/');
    if prefix.is_empty() || prefix.ends_with('/') {
        return prefix.to_string();
    }
    tracing::warn!(
        prefix = %prefix,
        "store prefix does not end with '/', appending it"
    );
    format!("{prefix}/")
}

/// Direct download link configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectDownloadConfig {
    /// Issue signed links instead of proxying bytes (requires S3 storage).
    #[serde(default)]
    pub enabled: bool,
    /// Default link lifetime in seconds.
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,
    /// Host (and optional port) of a CDN fronting the bucket. Links keep
    /// their signed path and query but point at this host.
    #[serde(default)]
    pub cdn_host: Option<String>,
}

fn default_expire_secs() -> u64 {
    3600 // 1 hour
}

impl Default for DirectDownloadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            expire_secs: default_expire_secs(),
            cdn_host: None,
        }
    }
}

impl DirectDownloadConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.expire_secs == 0 || self.expire_secs > MAX_LINK_EXPIRY_SECS {
            return Err(format!(
                "direct_download.expire_secs must be between 1 and {MAX_LINK_EXPIRY_SECS}, got {}",
                self.expire_secs
            ));
        }
        if let Some(host) = &self.cdn_host {
            if host.trim().is_empty() || host.contains('/') {
                return Err(format!(
                    "direct_download.cdn_host must be a bare host[:port], got {host:?}"
                ));
            }
        }
        Ok(())
    }
}

/// Garbage collection configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GcConfig {
    /// Extra protection window: objects modified less than this many seconds
    /// before the mark phase began are never collected. Objects modified after
    /// the mark phase began are always kept, whatever this value.
    #[serde(default)]
    pub grace_period_secs: u64,
    /// Keys requested per listing page.
    #[serde(default = "default_gc_page_size")]
    pub page_size: usize,
    /// Dry-run mode: report what would be deleted without actually deleting (default: false).
    #[serde(default)]
    pub dry_run: bool,
}

fn default_gc_page_size() -> usize {
    MAX_LISTING_PAGE_SIZE
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 0,
            page_size: default_gc_page_size(),
            dry_run: false,
        }
    }
}

impl GcConfig {
    /// Get the grace period as a Duration.
    pub fn grace_period(&self) -> Duration {
        // Saturate at i64::MAX to prevent overflow wrapping to negative
        let secs = i64::try_from(self.grace_period_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs)
    }

    /// Validate GC configuration for dangerous settings.
    pub fn validate(&self) -> Result<(), String> {
        if self.grace_period_secs > i64::MAX as u64 {
            return Err(format!(
                "gc.grace_period_secs {} exceeds maximum value {}",
                self.grace_period_secs,
                i64::MAX
            ));
        }
        if self.page_size == 0 || self.page_size > MAX_LISTING_PAGE_SIZE {
            return Err(format!(
                "gc.page_size must be between 1 and {MAX_LISTING_PAGE_SIZE}, got {}",
                self.page_size
            ));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Blob layout configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Signed link configuration.
    #[serde(default)]
    pub direct_download: DirectDownloadConfig,
    /// Garbage collection configuration.
    #[serde(default)]
    pub gc: GcConfig,
}

impl AppConfig {
    /// Create a test configuration backed by in-memory storage.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig::Memory,
            ..Self::default()
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> crate::Result<()> {
        self.storage
            .validate()
            .and_then(|()| self.direct_download.validate())
            .and_then(|()| self.gc.validate())
            .map_err(crate::Error::InvalidConfig)?;

        if self.direct_download.enabled && !matches!(self.storage, StorageConfig::S3 { .. }) {
            return Err(crate::Error::InvalidConfig(format!(
                "direct_download requires s3 storage, configured backend is {}",
                self.storage.backend_name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_config_defaults() {
        let config = GcConfig::default();
        assert_eq!(config.grace_period_secs, 0);
        assert_eq!(config.page_size, 1000);
        assert!(!config.dry_run);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_gc_config_rejects_oversized_page() {
        let config = GcConfig {
            page_size: 5000,
            ..GcConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_storage_config_s3_validate_partial_credentials() {
        let invalid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: None,
            force_path_style: false,
            server_side_encryption: false,
            connection: S3ConnectionConfig::default(),
        };
        assert!(invalid.validate().is_err());

        let valid = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            access_key_id: Some("access-key".to_string()),
            secret_access_key: Some("secret-key".to_string()),
            force_path_style: false,
            server_side_encryption: false,
            connection: S3ConnectionConfig::default(),
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn test_storage_config_s3_defaults_flags_to_false() {
        let json = r#"{"type":"s3","bucket":"test","endpoint":"https://s3.amazonaws.com"}"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();

        match config {
            StorageConfig::S3 {
                force_path_style,
                server_side_encryption,
                connection,
                ..
            } => {
                assert!(!force_path_style);
                assert!(!server_side_encryption);
                assert_eq!(connection, S3ConnectionConfig::default());
            }
            _ => panic!("expected S3 config"),
        }
    }

    #[test]
    fn test_storage_config_s3_connection_settings() {
        let json = r#"{
            "type": "s3",
            "bucket": "blobs",
            "connection": {
                "max_connections": 50,
                "max_retries": 3,
                "connect_timeout_ms": 50000,
                "socket_timeout_ms": 20000
            }
        }"#;
        let config: StorageConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());

        let StorageConfig::S3 { connection, .. } = config else {
            panic!("expected S3 config");
        };
        assert_eq!(connection.max_connections, Some(50));
        assert_eq!(connection.max_retries, Some(3));
        assert_eq!(
            connection.connect_timeout(),
            Some(std::time::Duration::from_secs(50))
        );
        assert_eq!(
            connection.socket_timeout(),
            Some(std::time::Duration::from_secs(20))
        );
    }

    #[test]
    fn test_storage_config_s3_rejects_zero_limits() {
        for connection in [
            S3ConnectionConfig {
                max_connections: Some(0),
                ..Default::default()
            },
            S3ConnectionConfig {
                connect_timeout_ms: Some(0),
                ..Default::default()
            },
            S3ConnectionConfig {
                socket_timeout_ms: Some(0),
                ..Default::default()
            },
        ] {
            assert!(connection.validate().is_err(), "{connection:?}");
        }
        // Zero retries disables retrying and is allowed.
        let no_retries = S3ConnectionConfig {
            max_retries: Some(0),
            ..Default::default()
        };
        assert!(no_retries.validate().is_ok());
    }

    #[test]
    fn test_storage_config_memory_deserializes() {
        let config: StorageConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert_eq!(config.backend_name(), "memory");
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("binaries"), "binaries/");
        assert_eq!(normalize_prefix("binaries/"), "binaries/");
        assert_eq!(normalize_prefix("/binaries"), "binaries/");
    }

    #[test]
    fn test_direct_download_expiry_bounds() {
        let mut config = DirectDownloadConfig::default();
        assert!(config.validate().is_ok());

        config.expire_secs = 0;
        assert!(config.validate().is_err());

        config.expire_secs = MAX_LINK_EXPIRY_SECS + 1;
        assert!(config.validate().is_err());

        config.expire_secs = MAX_LINK_EXPIRY_SECS;
        config.cdn_host = Some("https://cdn.example.com/".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_direct_download_requires_s3() {
        let mut config = AppConfig::for_testing();
        config.direct_download.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_app_config_from_partial_json() {
        let json = r#"{
            "storage": {"type": "memory"},
            "store": {"prefix": "bin", "digest_algorithm": "sha256"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.store.normalized_prefix(), "bin/");
        assert_eq!(config.store.digest_algorithm, DigestAlgorithm::Sha256);
        assert_eq!(config.direct_download.expire_secs, 3600);
        assert!(config.validate().is_ok());
    }
}
