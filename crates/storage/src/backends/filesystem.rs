//! Local filesystem storage backend.
//!
//! Keys map to paths below the root directory. Writes go to a uniquely named
//! temp file next to the target and are renamed into place, so readers never
//! observe a partial object. No content hash is recorded; fetches are verified
//! by rehashing.
//!
//! Listings are served in key order, so a token only needs to remember the
//! last key it returned.

use crate::error::{StorageError, StorageResult};
use crate::token::{self, BackendIdentity};
use crate::traits::{
    ListingCapabilities, ListingOptions, ListingPage, ListingResume, ObjectEntry, ObjectMeta,
    ObjectStore, PageStream, StoredObject,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Marker embedded in temp file names; such files are never listed.
const TEMP_MARKER: &str = ".tmp.";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend, creating the root if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn backend_identity(&self) -> BackendIdentity {
        BackendIdentity::Filesystem {
            root: self.root.to_string_lossy().into_owned(),
        }
    }

    /// Resolve `key` to a path below the root on the blocking pool.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || confine(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("key resolution: {e}")))
            })?
    }

    /// Every file key under `prefix` sorting after `after`.
    ///
    /// Temp files and symlinks are skipped. The whole subtree is walked on
    /// each call, so a resumed listing sees keys written since the token was
    /// issued.
    async fn keys_after(
        &self,
        prefix: &str,
        after: Option<&str>,
    ) -> StorageResult<BTreeSet<String>> {
        let mut keys = BTreeSet::new();
        let base = self.key_path(listing_dir(prefix)).await?;
        let mut pending = match fs::metadata(&base).await {
            Ok(meta) if meta.is_dir() => vec![base],
            Ok(_) => Vec::new(),
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::Io(e)),
        };

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !kind.is_file() {
                    continue;
                }
                let path = entry.path();
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace('\\', "/");
                let wanted = key.starts_with(prefix)
                    && !key.contains(TEMP_MARKER)
                    && after.is_none_or(|after| key.as_str() > after);
                if wanted {
                    keys.insert(key);
                }
            }
        }

        Ok(keys)
    }

    /// Stat a listed key; `None` when it vanished since the walk.
    async fn entry(&self, key: String) -> StorageResult<Option<ObjectEntry>> {
        match fs::metadata(self.root.join(&key)).await {
            Ok(meta) => Ok(Some(ObjectEntry {
                key,
                size: meta.len(),
                last_modified: meta.modified().ok().map(Into::into),
            })),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

fn io_context(e: std::io::Error, what: &str) -> StorageError {
    StorageError::Io(std::io::Error::new(e.kind(), format!("{what}: {e}")))
}

/// Map `key` to a path below `root`.
///
/// Only plain relative components are accepted, and the deepest part of the
/// path that already exists must still lie inside the root once symlinks are
/// followed. That covers links on the object itself and on any ancestor a
/// later `create_dir_all` would walk through.
fn confine(root: &Path, key: &str) -> StorageResult<PathBuf> {
    let relative = Path::new(key);
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!("unsafe key: {key}")));
    }

    let path = root.join(relative);
    let root = root
        .canonicalize()
        .map_err(|e| io_context(e, "storage root"))?;

    for existing in path.ancestors() {
        let meta = match std::fs::symlink_metadata(existing) {
            Ok(meta) => meta,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                continue;
            }
            Err(e) => return Err(io_context(e, "stat")),
        };
        let resolved = existing.canonicalize().map_err(|e| {
            if meta.file_type().is_symlink() {
                StorageError::InvalidKey(format!("dangling symlink in key: {key}"))
            } else {
                io_context(e, "canonicalize")
            }
        })?;
        if !resolved.starts_with(&root) {
            return Err(StorageError::InvalidKey(format!(
                "key escapes storage root: {key}"
            )));
        }
        break;
    }

    Ok(path)
}

fn map_not_found(key: &str, e: std::io::Error) -> StorageError {
    if e.kind() == ErrorKind::NotFound {
        StorageError::NotFound(key.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Directory holding every key that starts with `prefix`: `"bin/ab"` lives
/// under `bin`.
fn listing_dir(prefix: &str) -> &str {
    prefix.rsplit_once('/').map_or("", |(dir, _)| dir)
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.key_path(key).await?;
        fs::try_exists(&path).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
            checksum: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_object(&self, key: &str) -> StorageResult<StoredObject> {
        let meta = self.head(key).await?;
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| map_not_found(key, e))?;
        Ok(StoredObject {
            meta: ObjectMeta {
                size: data.len() as u64,
                ..meta
            },
            data: Bytes::from(data),
        })
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Unique temp name so concurrent writers of one key do not collide.
        let temp_name = format!("{TEMP_MARKER}{}", Uuid::new_v4());
        let temp_path = path.with_file_name(
            path.file_name()
                .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
                .unwrap_or_else(|| temp_name.clone()),
        );
        {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::Io(e));
        }

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_not_found(key, e))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {}", e),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }

    fn listing_capabilities(&self) -> ListingCapabilities {
        // Coarse filesystems (ext3, HFS+) keep whole seconds only.
        ListingCapabilities {
            timestamp_resolution: Duration::SECOND,
        }
    }

    fn list_pages<'a>(
        &'a self,
        prefix: &str,
        options: ListingOptions,
        resume: Option<ListingResume>,
    ) -> PageStream<'a> {
        let identity = self.backend_identity();
        let after = match resume {
            Some(resume) => match token::open(&resume.start_token, &identity, prefix, &options) {
                Ok(after) => Some(after),
                Err(e) => return Box::pin(futures::stream::once(async move { Err(e) })),
            },
            None => None,
        };
        let prefix = prefix.to_string();
        let page_size = options.normalized_page_size();

        let stream = async_stream::try_stream! {
            let mut keys = self
                .keys_after(&prefix, after.as_deref())
                .await?
                .into_iter()
                .peekable();

            loop {
                let batch: Vec<String> = keys.by_ref().take(page_size).collect();
                let more = keys.peek().is_some();
                let next_token = match batch.last() {
                    Some(last) if more => Some(token::seal(&identity, &prefix, &options, last)?),
                    _ => None,
                };

                let mut objects = Vec::with_capacity(batch.len());
                for key in batch {
                    if let Some(entry) = self.entry(key).await? {
                        objects.push(entry);
                    }
                }
                yield ListingPage { objects, next_token };

                if !more {
                    break;
                }
            }
        };

        Box::pin(stream)
    }
}
