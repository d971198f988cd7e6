//! Blob store abstraction: key/prefix addressed durable storage.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use sl_types::StoreError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Result alias for blob store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage shared by every worker. Objects are addressed as
/// `{prefix}/{name}`; prefixes behave like directories, so deleting
/// `vm-progress/1` never touches `vm-progress/10`.
#[async_trait]
pub trait BlobStore: Send + Sync + std::fmt::Debug {
    /// Upload `bytes` as `{prefix}/{name}`, replacing any existing object.
    async fn put(&self, prefix: &str, name: &str, bytes: Vec<u8>) -> StoreResult<()>;

    /// Download `{prefix}/{name}`. A missing object is [`StoreError::NotFound`].
    async fn get(&self, prefix: &str, name: &str) -> StoreResult<Vec<u8>>;

    /// Delete every object under `prefix`. A prefix holding no objects is not an error.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()>;

    /// Get store name
    fn name(&self) -> &str;
}

/// Join a prefix and an object name into a normalized key.
pub fn object_key(prefix: &str, name: &str) -> StoreResult<String> {
    let prefix = normalize(prefix)?;
    let name = normalize(name)?;
    if name.is_empty() {
        return Err(StoreError::InvalidPath {
            path: format!("{prefix}/"),
        });
    }
    Ok(if prefix.is_empty() {
        name
    } else {
        format!("{prefix}/{name}")
    })
}

fn normalize(path: &str) -> StoreResult<String> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments
        .iter()
        .any(|s| *s == "." || *s == ".." || s.contains('\\'))
    {
        return Err(StoreError::InvalidPath {
            path: path.to_string(),
        });
    }
    Ok(segments.join("/"))
}

/// Like [`normalize`], but the store root itself is never a deletable prefix.
fn normalize_prefix(prefix: &str) -> StoreResult<String> {
    let normalized = normalize(prefix)?;
    if normalized.is_empty() {
        return Err(StoreError::InvalidPath {
            path: prefix.to_string(),
        });
    }
    Ok(normalized)
}

// ---------------------------------------------------------------------------
// Local directory store
// ---------------------------------------------------------------------------

/// Blob store backed by a local directory (or a mounted bucket).
#[derive(Debug)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, s| path.join(s))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, prefix: &str, name: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let key = object_key(prefix, name)?;
        let path = self.resolve(&key);
        let write_failed = |e: std::io::Error| StoreError::WriteFailed {
            path: key.clone(),
            message: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_failed)?;
        }

        // Write-then-rename so readers never observe a partial object.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!("{file_name}.partial"));
        tokio::fs::write(&tmp, &bytes).await.map_err(write_failed)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_failed)?;

        debug!(key = %key, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn get(&self, prefix: &str, name: &str) -> StoreResult<Vec<u8>> {
        let key = object_key(prefix, name)?;
        match tokio::fs::read(self.resolve(&key)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound { path: key }),
            Err(e) => Err(StoreError::Unreadable {
                path: key,
                message: e.to_string(),
            }),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let prefix = normalize_prefix(prefix)?;
        let path = self.resolve(&prefix);
        let result = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result.map_err(|e| StoreError::DeleteFailed {
            prefix: prefix.clone(),
            message: e.to_string(),
        })?;

        debug!(prefix = %prefix, "deleted prefix");
        Ok(())
    }

    fn name(&self) -> &str {
        "local"
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-process blob store. Reads under a denied prefix fail with
/// [`StoreError::Unreadable`], which lets callers exercise the difference
/// between an empty slot and an unreadable one.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    denied: RwLock<Vec<String>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every object under `prefix` unreadable.
    pub fn deny_reads(&self, prefix: &str) {
        if let Ok(prefix) = normalize(prefix) {
            self.denied.write().push(prefix);
        }
    }

    pub fn allow_reads(&self) {
        self.denied.write().clear();
    }

    pub fn contains(&self, prefix: &str, name: &str) -> bool {
        object_key(prefix, name)
            .map(|key| self.objects.contains_key(&key))
            .unwrap_or(false)
    }

    /// Sorted keys, optionally restricted to a prefix.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix).unwrap_or_default();
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|key| under(key, &prefix))
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn is_denied(&self, key: &str) -> bool {
        self.denied.read().iter().any(|prefix| under(key, prefix))
    }
}

fn under(key: &str, prefix: &str) -> bool {
    prefix.is_empty()
        || key == prefix
        || (key.starts_with(prefix) && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, prefix: &str, name: &str, bytes: Vec<u8>) -> StoreResult<()> {
        let key = object_key(prefix, name)?;
        self.objects.insert(key, bytes);
        Ok(())
    }

    async fn get(&self, prefix: &str, name: &str) -> StoreResult<Vec<u8>> {
        let key = object_key(prefix, name)?;
        if self.is_denied(&key) {
            return Err(StoreError::Unreadable {
                path: key,
                message: "read denied".to_string(),
            });
        }
        self.objects
            .get(&key)
            .map(|bytes| bytes.value().clone())
            .ok_or(StoreError::NotFound { path: key })
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<()> {
        let prefix = normalize_prefix(prefix)?;
        self.objects.retain(|key, _| !under(key, &prefix));
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn object_keys_are_normalized() {
        assert_eq!(object_key("vm-progress/3/", "progress.json").unwrap(), "vm-progress/3/progress.json");
        assert_eq!(object_key("", "meta.json").unwrap(), "meta.json");
        assert!(object_key("vm-progress/../secrets", "token").is_err());
        assert!(object_key("vm-progress/3", "").is_err());
        assert!(normalize_prefix("/").is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store.put("vm-progress/1", "progress.json", b"{}".to_vec()).await.unwrap();

        assert_eq!(store.get("vm-progress/1", "progress.json").await.unwrap(), b"{}");
        let err = store.get("vm-progress/1", "checkpoint.bin").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn memory_delete_is_directory_scoped() {
        let store = MemoryBlobStore::new();
        store.put("vm-progress/1", "a", vec![1]).await.unwrap();
        store.put("vm-progress/10", "a", vec![2]).await.unwrap();
        store.put("best-models/1", "a", vec![3]).await.unwrap();

        store.delete_prefix("vm-progress/1").await.unwrap();
        assert_eq!(store.keys(""), vec!["best-models/1/a", "vm-progress/10/a"]);

        store.delete_prefix("vm-progress").await.unwrap();
        assert_eq!(store.keys(""), vec!["best-models/1/a"]);
    }

    #[tokio::test]
    async fn memory_denied_reads_are_unreadable() {
        let store = MemoryBlobStore::new();
        store.put("best-models/0", "progress.json", vec![1]).await.unwrap();
        store.deny_reads("best-models/0");

        let err = store.get("best-models/0", "progress.json").await.unwrap_err();
        assert!(matches!(err, StoreError::Unreadable { .. }));
        // Missing objects under a denied prefix are unreadable too, not absent.
        let err = store.get("best-models/0", "missing").await.unwrap_err();
        assert!(matches!(err, StoreError::Unreadable { .. }));

        store.allow_reads();
        assert!(store.get("best-models/0", "progress.json").await.is_ok());
    }

    #[tokio::test]
    async fn local_store_round_trip_and_delete() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();

        store.put("results/2", "r.json", b"[1]".to_vec()).await.unwrap();
        store.put("results/20", "r.json", b"[2]".to_vec()).await.unwrap();
        assert_eq!(store.get("results/2", "r.json").await.unwrap(), b"[1]");
        assert!(dir.path().join("results").join("2").join("r.json").exists());

        store.delete_prefix("results/2").await.unwrap();
        assert!(matches!(
            store.get("results/2", "r.json").await.unwrap_err(),
            StoreError::NotFound { .. }
        ));
        assert_eq!(store.get("results/20", "r.json").await.unwrap(), b"[2]");

        // Deleting something that never existed is fine.
        store.delete_prefix("shared-errors").await.unwrap();
    }

    #[tokio::test]
    async fn local_store_overwrites_in_place() {
        let dir = tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).unwrap();
        store.put("best-models/0", "progress.json", b"old".to_vec()).await.unwrap();
        store.put("best-models/0", "progress.json", b"new".to_vec()).await.unwrap();
        assert_eq!(store.get("best-models/0", "progress.json").await.unwrap(), b"new");
    }
}
