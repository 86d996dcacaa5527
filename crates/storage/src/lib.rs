//! Object storage abstraction and backends for depot.
//!
//! This crate provides:
//! - The `ObjectStore` trait: put/get/head/delete plus paginated, resumable listing
//! - Backend-reported content checksums used for integrity checks
//! - Backends: S3-compatible, local filesystem and in-memory

pub mod backends;
pub mod context;
pub mod error;
pub mod token;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend, s3::S3Backend};
pub use context::ListingContext;
pub use error::{StorageError, StorageResult};
pub use traits::{
    ContentChecksum, ContinuationToken, ListingCapabilities, ListingOptions, ListingPage,
    ListingResume, ObjectEntry, ObjectMeta, ObjectStore, ObjectStoreListStreamExt, StoredObject,
};

use depot_core::config::StorageConfig;
use std::sync::Arc;

/// Create an object store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ObjectStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::S3 {
            bucket,
            endpoint,
            region,
            access_key_id,
            secret_access_key,
            force_path_style,
            server_side_encryption,
            connection,
        } => {
            let backend = S3Backend::new(
                bucket,
                endpoint.clone(),
                region.clone(),
                access_key_id.clone(),
                secret_access_key.clone(),
                *force_path_style,
                connection,
            )
            .await?
            .with_server_side_encryption(*server_side_encryption);
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use depot_core::config::S3ConnectionConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn from_config_filesystem_ok() {
        let temp = tempdir().unwrap();
        let config = StorageConfig::Filesystem {
            path: temp.path().join("store"),
        };

        let store = from_config(&config).await.unwrap();
        store
            .put("hello.txt", Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(store.exists("hello.txt").await.unwrap());
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[tokio::test]
    async fn from_config_s3_ok() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: Some("minio:9000".to_string()),
            region: Some("us-east-1".to_string()),
            access_key_id: None,
            secret_access_key: None,
            force_path_style: true,
            server_side_encryption: true,
            connection: S3ConnectionConfig {
                max_connections: Some(16),
                ..Default::default()
            },
        };

        let store = from_config(&config).await.unwrap();
        assert_eq!(store.backend_name(), "s3");
        assert_eq!(
            store.listing_capabilities().timestamp_resolution,
            time::Duration::SECOND
        );
    }

    #[tokio::test]
    async fn from_config_memory_ok() {
        let store = from_config(&StorageConfig::Memory).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn from_config_rejects_partial_credentials() {
        let config = StorageConfig::S3 {
            bucket: "bucket".to_string(),
            endpoint: None,
            region: None,
            access_key_id: Some("access".to_string()),
            secret_access_key: None,
            force_path_style: false,
            server_side_encryption: false,
            connection: S3ConnectionConfig::default(),
        };

        match from_config(&config).await {
            Ok(_) => panic!("expected error"),
            Err(StorageError::Config(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
