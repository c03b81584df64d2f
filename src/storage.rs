//! Object storage and the metadata store.
//!
//! Artifacts and the metadata catalog live in an object store behind the
//! [`ObjectStore`] trait. [`StorageClient`] layers the catalog's
//! read-modify-write protocol on top: reads take shared access, an update
//! holds exclusive access from the read through the conditional write, and
//! a missing catalog object reads as the empty catalog.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::metadata::Metadata;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Metadata JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// A flat blob store. Implementations own the bucket prefix: the paths
/// passed here are bucket-relative UTF-8 keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, or `None` if no object exists at `path`.
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Write an object, replacing any existing one. Published objects are
    /// world-readable.
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Object store backed by a local directory tree.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> FsObjectStore {
        FsObjectStore { root: root.into() }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(self.root.join(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let full_path = self.root.join(path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(full_path, bytes).await?;
        Ok(())
    }
}

/// In-memory object store for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

#[cfg(test)]
#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.objects.read().await.get(path).cloned())
    }

    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// The metadata catalog plus artifact uploads, sharing one object store.
///
/// Concurrent day pipelines share a single client; the lock serializes
/// catalog updates so each one sees the previous writer's commit.
pub struct StorageClient {
    store: Box<dyn ObjectStore>,
    metadata_path: String,
    catalog_lock: RwLock<()>,
}

impl StorageClient {
    pub fn new(store: Box<dyn ObjectStore>, metadata_path: impl Into<String>) -> StorageClient {
        StorageClient {
            store,
            metadata_path: metadata_path.into(),
            catalog_lock: RwLock::new(()),
        }
    }

    /// Upload an artifact to its content-addressed path.
    pub async fn put_artifact(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.store.put(path, bytes).await
    }

    pub async fn get_metadata(&self) -> Result<Metadata, StorageError> {
        let _shared = self.catalog_lock.read().await;
        self.read_catalog().await
    }

    /// Read-modify-write the catalog. The closure mutates the current
    /// catalog and returns whether to commit; on commit the processed days
    /// are sorted newest-first before serialization. Returns whether a
    /// write happened.
    pub async fn update_metadata<F>(&self, apply: F) -> Result<bool, StorageError>
    where
        F: FnOnce(&mut Metadata) -> bool,
    {
        let _exclusive = self.catalog_lock.write().await;
        let mut metadata = self.read_catalog().await?;
        if !apply(&mut metadata) {
            debug!("metadata update aborted by caller");
            return Ok(false);
        }
        metadata.processed_days.sort_by(|a, b| b.day.cmp(&a.day));
        let bytes = serde_json::to_vec_pretty(&metadata)?;
        self.store.put(&self.metadata_path, &bytes).await?;
        Ok(true)
    }

    async fn read_catalog(&self) -> Result<Metadata, StorageError> {
        match self.store.get(&self.metadata_path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Metadata::default()),
        }
    }
}
