//! Uploaded file storage
//!
//! Files live under a locator `imports/<owner>/<job>/<file name>`. Retrieval URLs are
//! signed with a keyed SHA-256 over locator and expiry.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>>;

    /// Blocking reader over a stored file, for streaming parsers
    async fn open_reader(&self, locator: &str) -> Result<Box<dyn Read + Send>>;

    async fn delete(&self, locator: &str) -> Result<()>;

    fn signed_url(&self, locator: &str, expires_at: DateTime<Utc>) -> String;
}

/// Storage locator of an uploaded file
pub fn import_locator(owner_id: Uuid, job_id: Uuid, file_name: &str) -> String {
    let name: String = file_name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = name.trim_start_matches('.');
    let name = if name.is_empty() { "upload" } else { name };
    format!("imports/{}/{}/{}", owner_id, job_id, name)
}

/// SHA-256 of the file content, hex encoded
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn sign(locator: &str, expires: i64, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(locator.as_bytes());
    hasher.update(b"|");
    hasher.update(expires.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Local filesystem
// =============================================================================

pub struct LocalObjectStorage {
    root: PathBuf,
    signing_key: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, signing_key: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            signing_key: signing_key.into(),
        }
    }

    fn path_for(&self, locator: &str) -> Result<PathBuf> {
        let relative = Path::new(locator);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid storage locator: {}", locator);
        }
        Ok(self.root.join(relative))
    }

    /// Check a signature produced by `signed_url`
    pub fn verify(&self, locator: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        expires >= now.timestamp() && sign(locator, expires, &self.signing_key) == signature
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.path_for(locator)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn open_reader(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(locator)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file.into_std().await))
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        let path = self.path_for(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
        }
    }

    fn signed_url(&self, locator: &str, expires_at: DateTime<Utc>) -> String {
        let expires = expires_at.timestamp();
        format!(
            "/files/{}?expires={}&signature={}",
            locator,
            expires,
            sign(locator, expires, &self.signing_key)
        )
    }
}

// =============================================================================
// In-memory (tests)
// =============================================================================

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::io::Cursor;

    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryObjectStorage {
        files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryObjectStorage {
        pub fn contains(&self, locator: &str) -> bool {
            self.files.lock().contains_key(locator)
        }
    }

    #[async_trait]
    impl ObjectStorage for MemoryObjectStorage {
        async fn put(&self, locator: &str, bytes: &[u8]) -> Result<()> {
            self.files.lock().insert(locator.to_string(), bytes.to_vec());
            Ok(())
        }

        async fn get(&self, locator: &str) -> Result<Vec<u8>> {
            self.files
                .lock()
                .get(locator)
                .cloned()
                .with_context(|| format!("No such file: {}", locator))
        }

        async fn open_reader(&self, locator: &str) -> Result<Box<dyn Read + Send>> {
            let bytes = self.get(locator).await?;
            Ok(Box::new(Cursor::new(bytes)))
        }

        async fn delete(&self, locator: &str) -> Result<()> {
            self.files.lock().remove(locator);
            Ok(())
        }

        fn signed_url(&self, locator: &str, expires_at: DateTime<Utc>) -> String {
            format!("memory://{}?expires={}", locator, expires_at.timestamp())
        }
    }
}
