//! Object storage for job input and output archives
//!
//! Archives live in the same bucket the job manifests read from and publish
//! to: the input fetch container downloads `{name}-input.zip` and the cleanup
//! job uploads `{name}-output.zip`. [`BucketStorage`] talks to that bucket
//! through `object_store`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::{Error, Result};

/// Longest validity a V4 signed URL may have
pub const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How long a published output URL stays valid
pub const DEFAULT_URL_TTL: Duration = MAX_SIGNED_URL_TTL;

/// Upload and signed-URL retrieval
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing object
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// A time-limited URL for `key`. Fails with [`Error::Storage`] if the
    /// object does not exist.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Objects in one bucket, addressed by flat keys
pub struct BucketStorage {
    bucket: String,
    store: Arc<dyn ObjectStore>,
    signer: Arc<dyn Signer>,
}

impl BucketStorage {
    /// Storage over any `object_store` backend plus a URL signer for it
    pub fn new(bucket: impl Into<String>, store: Arc<dyn ObjectStore>, signer: Arc<dyn Signer>) -> Self {
        Self {
            bucket: bucket.into(),
            store,
            signer,
        }
    }

    /// Google Cloud Storage bucket `bucket_name`, authenticated and signing
    /// with the service account key at `service_account_path`
    pub fn gcs(bucket_name: &str, service_account_path: &Path) -> Result<Self> {
        let gcs = GoogleCloudStorageBuilder::new()
            .with_bucket_name(bucket_name)
            .with_service_account_path(service_account_path.to_string_lossy())
            .build()
            .map_err(|e| Error::Config(format!("failed to configure bucket {}: {}", bucket_name, e)))?;
        let gcs = Arc::new(gcs);
        Ok(Self::new(bucket_name, gcs.clone(), gcs))
    }

    /// Bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn path_for(&self, key: &str) -> Result<ObjectPath> {
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(Error::storage(key, "invalid object key"));
        }
        Ok(ObjectPath::from(key))
    }
}

#[async_trait]
impl ObjectStorage for BucketStorage {
    async fn upload(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key)?;
        self.store
            .put(&path, PutPayload::from(bytes.to_vec()))
            .await
            .map_err(|e| Error::storage(key, format!("upload to {} failed: {}", self.bucket, e)))?;
        debug!(key, bucket = %self.bucket, size = bytes.len(), "uploaded object");
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        let path = self.path_for(key)?;
        match self.store.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::storage(
                    key,
                    format!("object does not exist in bucket {}", self.bucket),
                ))
            }
            Err(e) => return Err(Error::storage(key, e.to_string())),
        }

        let url = self
            .signer
            .signed_url(Method::GET, &path, ttl.min(MAX_SIGNED_URL_TTL))
            .await
            .map_err(|e| Error::storage(key, format!("failed to sign url: {}", e)))?;
        Ok(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use url::Url;

    /// Signs by echoing the request into the query string
    #[derive(Debug)]
    struct EchoSigner;

    #[async_trait]
    impl Signer for EchoSigner {
        async fn signed_url(
            &self,
            method: Method,
            path: &ObjectPath,
            expires_in: Duration,
        ) -> object_store::Result<Url> {
            Ok(Url::parse(&format!(
                "https://storage.example/results/{}?method={}&expires_in={}",
                path,
                method,
                expires_in.as_secs()
            ))
            .unwrap())
        }
    }

    fn storage() -> (BucketStorage, Arc<InMemory>) {
        let store = Arc::new(InMemory::new());
        (
            BucketStorage::new("results", store.clone(), Arc::new(EchoSigner)),
            store,
        )
    }

    #[tokio::test]
    async fn upload_lands_in_bucket_under_key() {
        let (storage, store) = storage();
        storage.upload("x-input.zip", b"PK").await.unwrap();

        let stored = store
            .get(&ObjectPath::from("x-input.zip"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        assert_eq!(&stored[..], b"PK");
    }

    #[tokio::test]
    async fn existing_object_gets_signed_get_url() {
        let (storage, _) = storage();
        storage.upload("x-output.zip", b"PK").await.unwrap();

        let url = storage
            .signed_url("x-output.zip", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            url,
            "https://storage.example/results/x-output.zip?method=GET&expires_in=60"
        );
    }

    #[tokio::test]
    async fn ttl_is_capped_at_signing_limit() {
        let (storage, _) = storage();
        storage.upload("x-output.zip", b"PK").await.unwrap();

        let url = storage
            .signed_url("x-output.zip", Duration::from_secs(30 * 24 * 60 * 60))
            .await
            .unwrap();
        assert!(url.ends_with(&format!("expires_in={}", MAX_SIGNED_URL_TTL.as_secs())));
    }

    #[tokio::test]
    async fn missing_object_fails() {
        let (storage, _) = storage();
        let err = storage
            .signed_url("nope.zip", DEFAULT_URL_TTL)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage { ref key, .. } if key == "nope.zip"));
    }

    #[tokio::test]
    async fn unsafe_keys_are_rejected() {
        let (storage, _) = storage();
        assert!(storage.upload("../evil", b"").await.is_err());
        assert!(storage.upload("a/b", b"").await.is_err());
        assert!(storage.upload("", b"").await.is_err());
    }
}
