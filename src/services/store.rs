use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use uuid::Uuid;

/// Key-value store for image payloads, keyed by item id.
///
/// The store is the authoritative image cache: the job-state record holds
/// metadata only, and the walker fetches the payload from here right before
/// dispatching an item.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, id: Uuid, data: &[u8], content_type: &str) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Vec<u8>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
    async fn health_check(&self) -> Result<(), StoreError>;
}

/// S3-compatible image store (R2 and friends).
pub struct ImageStore {
    bucket: Box<Bucket>,
}

impl ImageStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
    ) -> Result<Self, StoreError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self { bucket })
    }

    fn key(id: Uuid) -> String {
        format!("images/{id}")
    }
}

#[async_trait]
impl BlobStore for ImageStore {
    async fn put(&self, id: Uuid, data: &[u8], content_type: &str) -> Result<(), StoreError> {
        self.bucket
            .put_object_with_content_type(Self::key(id), data, content_type)
            .await
            .map_err(StoreError::S3)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Vec<u8>, StoreError> {
        let response = self
            .bucket
            .get_object(Self::key(id))
            .await
            .map_err(StoreError::S3)?;
        Ok(response.to_vec())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.bucket
            .delete_object(Self::key(id))
            .await
            .map_err(StoreError::S3)?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.bucket
            .list("images/".to_string(), Some("/".to_string()))
            .await
            .map_err(StoreError::S3)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("store configuration error: {0}")]
    Config(String),
}
