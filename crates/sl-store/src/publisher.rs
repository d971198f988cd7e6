//! Buffered publishing: every payload is staged in local scratch space before
//! it is uploaded, so the uploaded object is exactly what was staged.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sl_types::{object_path, SlResult, StateError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::blob::BlobStore;

/// Stages payloads under a scratch directory and commits them to a [`BlobStore`].
#[derive(Debug, Clone)]
pub struct BufferedPublisher {
    scratch_dir: PathBuf,
    store: Arc<dyn BlobStore>,
}

impl BufferedPublisher {
    pub fn new<P: AsRef<Path>>(scratch_dir: P, store: Arc<dyn BlobStore>) -> SlResult<Self> {
        let scratch_dir = scratch_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self { scratch_dir, store })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Local staging location for an object name.
    pub fn scratch_path(&self, name: &str) -> PathBuf {
        self.scratch_dir.join(name.replace('/', "_"))
    }

    /// Stage `bytes` as `name` in scratch space, then upload the staged file to `prefix`.
    pub async fn publish(&self, name: &str, bytes: &[u8], prefix: &str) -> SlResult<()> {
        let staged = self.scratch_path(name);
        tokio::fs::write(&staged, bytes).await?;
        let payload = tokio::fs::read(&staged).await?;

        self.store.put(prefix, name, payload).await?;
        debug!(prefix, name, bytes = bytes.len(), "published");
        Ok(())
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
        prefix: &str,
    ) -> SlResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.publish(name, &bytes, prefix).await
    }

    pub async fn fetch(&self, prefix: &str, name: &str) -> SlResult<Vec<u8>> {
        Ok(self.store.get(prefix, name).await?)
    }

    /// Like [`BufferedPublisher::fetch`], but a missing object is `None`.
    /// Every other failure is still an error.
    pub async fn fetch_optional(&self, prefix: &str, name: &str) -> SlResult<Option<Vec<u8>>> {
        match self.fetch(prefix, name).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Download an object into scratch space and return the local path.
    pub async fn fetch_to_scratch(&self, prefix: &str, name: &str) -> SlResult<PathBuf> {
        let bytes = self.fetch(prefix, name).await?;
        let local = self.scratch_path(name);
        tokio::fs::write(&local, &bytes).await?;
        Ok(local)
    }

    /// Fetch and parse a JSON document; a parse failure is malformed state.
    pub async fn fetch_json<T: DeserializeOwned>(&self, prefix: &str, name: &str) -> SlResult<T> {
        let bytes = self.fetch(prefix, name).await?;
        parse_document(&bytes, prefix, name)
    }

    pub async fn fetch_optional_json<T: DeserializeOwned>(
        &self,
        prefix: &str,
        name: &str,
    ) -> SlResult<Option<T>> {
        match self.fetch_optional(prefix, name).await? {
            Some(bytes) => parse_document(&bytes, prefix, name).map(Some),
            None => Ok(None),
        }
    }

    pub async fn delete_prefix(&self, prefix: &str) -> SlResult<()> {
        self.store.delete_prefix(prefix).await?;
        debug!(prefix, "deleted prefix");
        Ok(())
    }
}

fn parse_document<T: DeserializeOwned>(bytes: &[u8], prefix: &str, name: &str) -> SlResult<T> {
    serde_json::from_slice(bytes).map_err(|e| {
        StateError::Malformed {
            path: object_path(prefix, name),
            message: e.to_string(),
        }
        .into()
    })
}
