//! Blob storage for media, optimized variants and quoted-post screenshots
//!
//! Keys used by Threadcast:
//! - `media/{media_id}`: canonical copy of an uploaded media file
//! - `media/{media_id}_{platform}`: size-optimized variant for one platform
//! - `quoted_posts/{sha256(url)}`: rendered screenshot of a quoted post
//! - `unprocessed_media/{job_id}`: raw upload waiting for ingestion

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{Result, StorageError};
use crate::types::SocialPlatform;

type HmacSha256 = Hmac<Sha256>;

pub fn media_key(media_id: &str) -> String {
    format!("media/{}", media_id)
}

pub fn media_variant_key(media_id: &str, platform: SocialPlatform) -> String {
    format!("media/{}_{}", media_id, platform.as_str())
}

pub fn quoted_post_key(sanitized_url: &str) -> String {
    format!("quoted_posts/{}", hex::encode(Sha256::digest(sanitized_url.as_bytes())))
}

pub fn unprocessed_key(job_id: &str) -> String {
    format!("unprocessed_media/{}", job_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignMethod {
    Get,
    Put,
}

impl PresignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignMethod::Get => "GET",
            PresignMethod::Put => "PUT",
        }
    }
}

/// Key/value byte store with presigned URL support
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// A URL granting `method` on `key` to anyone holding it, until `expires_in` elapses
    fn presigned_url(&self, key: &str, method: PresignMethod, expires_in: Duration)
        -> Result<String>;
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment == ".." || segment.is_empty())
    {
        return Err(StorageError::InvalidKey(key.to_string()).into());
    }
    Ok(())
}

fn not_found_or_io(key: &str, error: std::io::Error) -> crate::error::ThreadcastError {
    if error.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(key.to_string()).into()
    } else {
        StorageError::Io(error).into()
    }
}

/// Filesystem-backed blob store.
///
/// Blobs live under `root`; each has a `.content-type` sidecar. Presigned URLs
/// point at `public_base_url` and carry an HMAC-SHA256 signature over
/// method, key and expiry that the serving side checks with [`LocalBlobStore::verify`].
pub struct LocalBlobStore {
    root: PathBuf,
    public_base_url: String,
    signing_key: Vec<u8>,
}

impl LocalBlobStore {
    pub fn new(root: &str, public_base_url: &str, signing_key: &str) -> Result<Self> {
        let root = PathBuf::from(shellexpand::tilde(root).to_string());
        std::fs::create_dir_all(&root).map_err(StorageError::Io)?;
        Ok(Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            signing_key: signing_key.as_bytes().to_vec(),
        })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn content_type_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".content-type");
        PathBuf::from(name)
    }

    fn signature(&self, key: &str, method: PresignMethod, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| StorageError::InvalidKey(format!("signing key: {}", e)))?;
        mac.update(format!("{}\n{}\n{}", method.as_str(), key, expires).as_bytes());
        Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
    }

    fn presign_at(
        &self,
        key: &str,
        method: PresignMethod,
        expires: i64,
    ) -> Result<String> {
        validate_key(key)?;
        let signature = self.signature(key, method, expires)?;
        Ok(format!(
            "{}/{}?method={}&expires={}&signature={}",
            self.public_base_url,
            key,
            method.as_str(),
            expires,
            signature
        ))
    }

    /// Check a presigned request: signature matches and `now` is before expiry
    pub fn verify(
        &self,
        key: &str,
        method: PresignMethod,
        expires: i64,
        signature: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> bool {
        if now.timestamp() > expires {
            return false;
        }
        let Ok(provided) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_key) else {
            return false;
        };
        mac.update(format!("{}\n{}\n{}", method.as_str(), key, expires).as_bytes());
        mac.verify_slice(&provided).is_ok()
    }

    pub async fn content_type(&self, key: &str) -> Result<String> {
        let path = self.path_for(key)?;
        tokio::fs::read_to_string(Self::content_type_path(&path))
            .await
            .map_err(|e| not_found_or_io(key, e))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| not_found_or_io(key, e))
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(StorageError::Io)?;
        }
        tokio::fs::write(&path, data).await.map_err(StorageError::Io)?;
        tokio::fs::write(Self::content_type_path(&path), content_type)
            .await
            .map_err(StorageError::Io)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e).into()),
        }
        let _ = tokio::fs::remove_file(Self::content_type_path(&path)).await;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.map_err(StorageError::Io)?)
    }

    fn presigned_url(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> Result<String> {
        let expires = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;
        self.presign_at(key, method, expires)
    }
}

/// In-process blob store, used by tests and single-process setups
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.read().await.get(key).map(|(_, ct)| ct.clone())
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()).into())
    }

    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
        validate_key(key)?;
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (data.to_vec(), content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(key))
    }

    fn presigned_url(
        &self,
        key: &str,
        method: PresignMethod,
        expires_in: Duration,
    ) -> Result<String> {
        validate_key(key)?;
        Ok(format!(
            "memory://{}?method={}&expires_in={}",
            key,
            method.as_str(),
            expires_in.as_secs()
        ))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A [`MemoryBlobStore`] whose next reads and writes fail with an I/O error
    #[derive(Default)]
    pub struct FlakyBlobStore {
        pub inner: MemoryBlobStore,
        pub get_failures: AtomicUsize,
        pub put_failures: AtomicUsize,
    }

    impl FlakyBlobStore {
        pub fn new(get_failures: usize, put_failures: usize) -> Self {
            Self {
                inner: MemoryBlobStore::new(),
                get_failures: AtomicUsize::new(get_failures),
                put_failures: AtomicUsize::new(put_failures),
            }
        }

        fn trip(counter: &AtomicUsize) -> Result<()> {
            let tripped = counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if tripped {
                Err(StorageError::Io(std::io::Error::other("blip")).into())
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl BlobStore for FlakyBlobStore {
        async fn get(&self, key: &str) -> Result<Vec<u8>> {
            Self::trip(&self.get_failures)?;
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<()> {
            Self::trip(&self.put_failures)?;
            self.inner.put(key, data, content_type).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key).await
        }

        fn presigned_url(
            &self,
            key: &str,
            method: PresignMethod,
            expires_in: Duration,
        ) -> Result<String> {
            self.inner.presigned_url(key, method, expires_in)
        }
    }
}
