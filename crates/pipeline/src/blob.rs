//! The [`BlobStore`] seam and its local and in-memory implementations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::BlobError;

/// Object storage for media.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend tag recorded on attachment rows.
    fn tag(&self) -> &'static str;

    async fn upload(&self, bytes: &[u8], name: &str) -> Result<(), BlobError>;

    /// URL a client can fetch `name` from, valid for at least `ttl`.
    async fn url(&self, name: &str, ttl: Duration) -> Result<String, BlobError>;

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError>;

    async fn exists(&self, name: &str) -> Result<bool, BlobError>;
}

/// Blob names are flat file names.
pub fn validate_name(name: &str) -> Result<(), BlobError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name == "."
        || name == ".."
        || name.starts_with('.')
    {
        return Err(BlobError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Local filesystem
// ---------------------------------------------------------------------------

/// Stores blobs as files under `root`, served at `public_url`.
///
/// URLs are not signed; `ttl` is ignored.
pub struct LocalBlobStore {
    root: PathBuf,
    public_url: String,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>, public_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn path(&self, name: &str) -> Result<PathBuf, BlobError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn tag(&self) -> &'static str {
        "local"
    }

    async fn upload(&self, bytes: &[u8], name: &str) -> Result<(), BlobError> {
        let path = self.path(name)?;
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(path = %path.display(), size = bytes.len(), "Blob written");
        Ok(())
    }

    async fn url(&self, name: &str, _ttl: Duration) -> Result<String, BlobError> {
        validate_name(name)?;
        Ok(format!("{}/{name}", self.public_url))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.path(name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool, BlobError> {
        let path = self.path(name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bytes of `name`, or empty when absent.
    pub async fn get_bytes(&self, name: &str) -> Vec<u8> {
        self.blobs.read().await.get(name).cloned().unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn tag(&self) -> &'static str {
        "memory"
    }

    async fn upload(&self, bytes: &[u8], name: &str) -> Result<(), BlobError> {
        validate_name(name)?;
        self.blobs
            .write()
            .await
            .insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn url(&self, name: &str, _ttl: Duration) -> Result<String, BlobError> {
        validate_name(name)?;
        Ok(format!("memory://{name}"))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool, BlobError> {
        Ok(self.blobs.read().await.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn names_must_be_flat() {
        assert!(validate_name("12_image_0.png").is_ok());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/b.png").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("").is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store.upload(b"abc", "a.bin").await.unwrap();
        assert!(store.exists("a.bin").await.unwrap());
        assert_eq!(store.get("a.bin").await.unwrap(), b"abc");
        assert_matches!(store.get("b.bin").await, Err(BlobError::NotFound(_)));
    }

    #[tokio::test]
    async fn local_store_writes_under_root() {
        let root = std::env::temp_dir().join(format!("fleet-blob-test-{}", std::process::id()));
        let store = LocalBlobStore::new(root.clone(), "http://cdn.local/media/");

        store.upload(b"xyz", "t_1.png").await.unwrap();
        assert!(store.exists("t_1.png").await.unwrap());
        assert_eq!(store.get("t_1.png").await.unwrap(), b"xyz");
        assert_eq!(
            store.url("t_1.png", Duration::from_secs(60)).await.unwrap(),
            "http://cdn.local/media/t_1.png"
        );
        assert_matches!(store.get("missing.png").await, Err(BlobError::NotFound(_)));

        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
