pub mod bronze;

use async_trait::async_trait;
use common::config::{StorageBackend, StorageConfig};
use common::{Error, Result};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::{debug, info};

/// Bucket-scoped object access used by the bronze writer, the object-store
/// watermark store and the object-store ingestion log.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()>;
    /// `None` when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;
    fn bucket(&self) -> &str;
}

pub struct ObjectStoreStorage {
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(bucket: &str, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.to_string(),
            store,
        }
    }

    pub fn in_memory(bucket: &str) -> Self {
        Self::new(bucket, Arc::new(InMemory::new()))
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let bucket = config.bronze_bucket.as_str();
        let store: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::S3 => {
                let s3 = AmazonS3Builder::new()
                    .with_bucket_name(bucket)
                    .with_region(&config.region)
                    .with_access_key_id(&config.access_key)
                    .with_secret_access_key(&config.secret_key)
                    .with_endpoint(&config.endpoint)
                    .with_allow_http(true)
                    .build()?;
                Arc::new(s3)
            }
            StorageBackend::Local => {
                let root = std::path::Path::new(&config.local_root).join(bucket);
                std::fs::create_dir_all(&root)?;
                Arc::new(LocalFileSystem::new_with_prefix(&root)?)
            }
            StorageBackend::Memory => Arc::new(InMemory::new()),
        };

        info!(backend = ?config.backend, bucket, "Initialised object storage");
        Ok(Self::new(bucket, store))
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    async fn put_object(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = Path::parse(key)?;
        self.store
            .put(&path, PutPayload::from(data.to_vec()))
            .await?;
        debug!(bucket = %self.bucket, key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = Path::parse(key)?;
        match self.store.get(&path).await {
            Ok(result) => Ok(Some(result.bytes().await?.to_vec())),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::parse(prefix)?;
        let mut keys: Vec<String> = self
            .store
            .list(Some(&prefix))
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await?;
        keys.sort();
        Ok(keys)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let storage = ObjectStoreStorage::in_memory("bronze");
        storage.put_object("a/2.json", b"two").await.unwrap();
        storage.put_object("a/1.json", b"one").await.unwrap();
        storage.put_object("b/1.json", b"other").await.unwrap();

        assert_eq!(
            storage.get_object("a/1.json").await.unwrap().as_deref(),
            Some(&b"one"[..])
        );
        assert!(storage.get_object("a/missing.json").await.unwrap().is_none());
        assert_eq!(
            storage.list_objects("a").await.unwrap(),
            vec!["a/1.json".to_string(), "a/2.json".to_string()]
        );
        assert_eq!(storage.bucket(), "bronze");
    }

    #[tokio::test]
    async fn test_local_backend_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            backend: StorageBackend::Local,
            local_root: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let storage = ObjectStoreStorage::from_config(&config).unwrap();
        storage.put_object("watermarks/loans.json", b"{}").await.unwrap();

        assert!(dir.path().join("bronze/watermarks/loans.json").exists());
    }
}
