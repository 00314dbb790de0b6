use std::{env, fmt::Debug, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use object_store::{
    aws::{AmazonS3Builder, AmazonS3ConfigKey},
    parse_url,
    path::Path,
    signer::Signer,
    ObjectStore,
    ObjectStoreScheme,
    WriteMultipart,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
}

impl BlobStorageConfig {
    pub fn new(path: &str) -> Self {
        BlobStorageConfig {
            path: Some(format!("file://{}", path)),
        }
    }
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap()
                .join("vault_storage/blobs")
                .to_str()
                .unwrap()
        );
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub key: String,
    pub size_bytes: u64,
    pub sha256_hash: String,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    // S3 supports native presigned URLs; other schemes fall back to
    // LocalUrlSigner at the service layer.
    presigner: Option<Arc<dyn Signer>>,
    path: Path,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url_str = config
            .path
            .ok_or_else(|| anyhow!("blob storage path is required"))?;
        let url = url_str.parse::<Url>()?;
        let (scheme, _) = ObjectStoreScheme::parse(&url)?;
        match scheme {
            ObjectStoreScheme::AmazonS3 => {
                // inject AWS environment variables to prioritize keys over
                // instance metadata credentials.
                let mut s3_builder = AmazonS3Builder::new().with_url(url_str.as_str());
                for (os_key, os_value) in std::env::vars_os() {
                    if let (Some(key), Some(value)) = (os_key.to_str(), os_value.to_str()) {
                        if key.starts_with("AWS_") {
                            if let Ok(config_key) = key.to_ascii_lowercase().parse::<AmazonS3ConfigKey>() {
                                s3_builder = s3_builder.with_config(config_key, value);
                            }
                        }
                    }
                }
                let s3 = Arc::new(s3_builder.build()?);
                let (_, path) = parse_url(&url)?;
                Ok(Self {
                    object_store: s3.clone(),
                    presigner: Some(s3),
                    path,
                })
            }
            _ => {
                let (object_store, path) = parse_url(&url)?;
                Ok(Self {
                    object_store: Arc::from(object_store),
                    presigner: None,
                    path,
                })
            }
        }
    }

    pub fn get_object_store(&self) -> Arc<dyn ObjectStore> {
        self.object_store.clone()
    }

    pub fn get_path(&self) -> Path {
        self.path.clone()
    }

    pub async fn put(
        &self,
        key: &str,
        data: impl futures::Stream<Item = Result<Bytes>> + Send + Unpin,
    ) -> Result<PutResult, anyhow::Error> {
        let mut hasher = Sha256::new();
        let mut hashed_stream = data.map(|item| {
            item.map(|bytes| {
                hasher.update(&bytes);
                bytes
            })
        });

        let path = self.path.child(key);
        let m = self.object_store.put_multipart(&path).await?;
        let mut w = WriteMultipart::new(m);
        let mut size_bytes = 0;
        while let Some(chunk) = hashed_stream.next().await {
            w.wait_for_capacity(1).await?;
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            w.write(&chunk);
        }
        w.finish().await?;

        let hash = format!("{:x}", hasher.finalize());
        Ok(PutResult {
            key: path.to_string(),
            size_bytes,
            sha256_hash: hash,
        })
    }

    pub async fn put_bytes(&self, key: &str, data: Bytes) -> Result<PutResult> {
        let stream = Box::pin(futures::stream::once(async move { Ok(data) }));
        self.put(key, stream).await
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        let client_clone = self.object_store.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let get_result = client_clone
            .get(&Self::object_path(key)?)
            .await
            .map_err(|e| anyhow!("can't get object {:?}: {:?}", key, e))?;
        let key = key.to_string();
        tokio::spawn(async move {
            let mut stream = get_result.into_stream();
            while let Some(chunk) = stream.next().await {
                let _ = tx
                    .send(chunk.map_err(|e| anyhow!("error reading object {:?}: {:?}", key, e)));
            }
        });
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let mut reader = self.get(key).await?;
        let mut bytes = BytesMut::new();
        while let Some(chunk) = reader.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        Ok(bytes.into())
    }

    /// Writes at an exact object path, as returned by [`Self::put`].
    /// Used for derived assets whose keys are based on a stored key.
    pub async fn put_bytes_at(&self, key: &str, data: Bytes) -> Result<()> {
        self.object_store
            .put(&Self::object_path(key)?, data.into())
            .await?;
        Ok(())
    }

    /// Idempotent: deleting an object that is already gone succeeds, so a
    /// retried purge never trips over the work its previous attempt did.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.object_store.delete(&Self::object_path(key)?).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns a natively presigned URL when the backing store supports it
    /// (S3). Callers fall back to [`LocalUrlSigner`] otherwise.
    pub async fn presigned_url(&self, key: &str, expires_in: Duration) -> Result<Option<String>> {
        match &self.presigner {
            Some(signer) => {
                let url = signer
                    .signed_url(hyper::Method::GET, &Self::object_path(key)?, expires_in)
                    .await?;
                Ok(Some(url.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Keys handed back by [`Self::put`] are already fully rendered paths;
    /// `Path::parse` takes them verbatim, whereas `Path::from` would
    /// re-encode any `%` and resolve to a different object.
    fn object_path(key: &str) -> Result<Path> {
        Path::parse(key).map_err(|e| anyhow!("invalid object key {:?}: {:?}", key, e))
    }
}

/// Issues and verifies short-lived HMAC-style signed URLs served by the
/// application itself, for deployments whose blob backend cannot presign.
#[derive(Clone)]
pub struct LocalUrlSigner {
    base_url: String,
    secret: String,
}

impl LocalUrlSigner {
    pub fn new(base_url: &str, secret: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            secret: secret.to_string(),
        }
    }

    pub fn sign(&self, key: &str, now_epoch_secs: u64, ttl: Duration) -> String {
        let expires = now_epoch_secs + ttl.as_secs();
        let sig = self.signature(key, expires);
        format!(
            "{}/blobs/{}?expires={}&sig={}",
            self.base_url, key, expires, sig
        )
    }

    pub fn verify(&self, key: &str, expires: u64, sig: &str, now_epoch_secs: u64) -> bool {
        if now_epoch_secs > expires {
            return false;
        }
        let expected = self.signature(key, expires);
        expected.as_bytes().ct_eq(sig.as_bytes()).into()
    }

    fn signature(&self, key: &str, expires: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_read_delete_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let config = BlobStorageConfig::new(temp_dir.path().to_str().unwrap());
        let storage = BlobStorage::new(config)?;

        let res = storage.put_bytes("v1/hello.txt", Bytes::from("hello")).await?;
        assert_eq!(res.size_bytes, 5);
        assert_eq!(res.sha256_hash.len(), 64);

        let read = storage.read_bytes(&res.key).await?;
        assert_eq!(read, Bytes::from("hello"));

        storage.delete(&res.key).await?;
        assert!(storage.read_bytes(&res.key).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_keys_with_slash_and_percent_round_trip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(BlobStorageConfig::new(temp_dir.path().to_str().unwrap()))?;

        // put() percent-encodes these into the stored path; the key it
        // returns must resolve back to the same object on read and delete.
        for name in ["v1/file.bin", "report 50%.pdf", "a%2Fb.txt"] {
            let res = storage.put_bytes(name, Bytes::from("payload")).await?;
            let read = storage.read_bytes(&res.key).await?;
            assert_eq!(read, Bytes::from("payload"), "key {:?}", name);
            storage.delete(&res.key).await?;
            assert!(storage.read_bytes(&res.key).await.is_err());
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(BlobStorageConfig::new(temp_dir.path().to_str().unwrap()))?;

        let res = storage.put_bytes("victim.bin", Bytes::from("x")).await?;
        storage.delete(&res.key).await?;
        storage.delete(&res.key).await?;
        storage.delete("never/stored.bin").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_no_presign_on_disk_backend() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let storage = BlobStorage::new(BlobStorageConfig::new(temp_dir.path().to_str().unwrap()))?;
        let url = storage
            .presigned_url("some/key", Duration::from_secs(60))
            .await?;
        assert!(url.is_none());
        Ok(())
    }

    #[test]
    fn test_local_signer_verify() {
        let signer = LocalUrlSigner::new("http://localhost:8900/", "secret");
        let url = signer.sign("v1/a.png", 1_000, Duration::from_secs(3600));
        assert!(url.starts_with("http://localhost:8900/blobs/v1/a.png?expires=4600&sig="));

        let sig = url.split("sig=").nth(1).unwrap();
        assert!(signer.verify("v1/a.png", 4_600, sig, 1_001));
        // expired
        assert!(!signer.verify("v1/a.png", 4_600, sig, 4_601));
        // tampered key
        assert!(!signer.verify("v1/b.png", 4_600, sig, 1_001));
    }
}
