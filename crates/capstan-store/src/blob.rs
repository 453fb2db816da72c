//! Content-addressed block storage.
//!
//! Blocks are immutable: the key embeds the sha-256 of the content, so a
//! concurrent double-write is harmless and a re-write is a no-op. Only
//! the GC worker ever deletes.

use async_trait::async_trait;
use capstan_core::{Error, Result};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Hex sha-256 of a byte slice — block ids and checksums.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Checksum verification on read. A mismatch is surfaced as
/// `StorageCorruption` so hydration can distinguish it from a miss.
pub fn verify_checksum(bytes: &[u8], expected: &str) -> Result<()> {
    let actual = content_hash(bytes);
    if actual == expected {
        Ok(())
    } else {
        Err(Error::StorageCorruption(format!(
            "checksum mismatch: expected {expected}, got {actual}"
        )))
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object. Idempotent for content-addressed keys.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    /// Read an object; `Error::NotFound` when absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Existence check without fetching the body.
    async fn head(&self, key: &str) -> Result<bool>;

    /// Delete an object. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory backend for tests and single-node runs.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::NotFound(format!("block {key}")))
    }

    async fn head(&self, key: &str) -> Result<bool> {
        Ok(self.objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.remove(key);
        Ok(())
    }
}

/// Filesystem backend laid out exactly like the object-store keyspace.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a partial object.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("block {key}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
