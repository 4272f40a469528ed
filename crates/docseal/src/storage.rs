//! Object storage for document artifacts and stamp images.
//!
//! Keys are relative, `/`-separated paths. `put` overwrites.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::SealError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SealError>;
    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<(), SealError>;
    async fn delete(&self, key: &str) -> Result<(), SealError>;
}

/// Rejects empty, absolute and parent-escaping keys.
pub fn validate_key(key: &str) -> Result<(), SealError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(SealError::Validation(format!("invalid storage key {key:?}")));
    }
    let clean = Path::new(key)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !clean {
        return Err(SealError::Validation(format!("invalid storage key {key:?}")));
    }
    Ok(())
}

/// Filesystem-backed store rooted at a directory.
pub struct FsObjectStore {
    root_dir: PathBuf,
}

impl FsObjectStore {
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self, SealError> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir)
            .await
            .map_err(|e| SealError::ExternalIo(format!("creating {}: {e}", root_dir.display())))?;

        info!(path = %root_dir.display(), "Initialized object store");

        Ok(Self { root_dir })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, SealError> {
        validate_key(key)?;
        Ok(self.root_dir.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SealError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => {
                debug!(key, size = bytes.len(), "Read object");
                Ok(bytes)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SealError::not_found("stored object", key))
            }
            Err(e) => Err(SealError::ExternalIo(format!("reading {key}: {e}"))),
        }
    }

    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<(), SealError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| SealError::ExternalIo(format!("creating directory for {key}: {e}")))?;
        }
        let size = bytes.len();
        fs::write(&path, bytes)
            .await
            .map_err(|e| SealError::ExternalIo(format!("writing {key}: {e}")))?;
        debug!(key, size, content_type, "Stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SealError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SealError::ExternalIo(format!("deleting {key}: {e}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-process store, used by tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, StoredObject>>,
    reads: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far, hits and misses alike.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub async fn content_type(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.content_type.clone())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.read().await.contains_key(key)
    }

    /// Stored keys under `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, SealError> {
        validate_key(key)?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| SealError::not_found("stored object", key))
    }

    async fn put(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<(), SealError> {
        validate_key(key)?;
        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SealError> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}
