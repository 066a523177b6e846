//! C4: object-store adapter (spec §2, §6 "Object store").
//!
//! The core treats the backing object store as an external collaborator
//! (spec §1 Non-goals); this module specifies only the `put/get/delete`
//! contract the pipeline invokes, plus an in-memory adapter used in tests
//! and a filesystem-backed adapter for local/dev runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::errors::CoreError;

#[derive(Debug, Clone)]
pub struct PutResult {
    pub bucket: String,
    pub key: String,
    pub etag: String,
    pub size: u64,
}

/// Documents are persisted under `{bucket}/{userId}/{uuid}/{filename}` (spec §6).
pub fn object_key(user_id: i64, filename: &str) -> String {
    format!("{}/{}/{}", user_id, Uuid::new_v4(), filename)
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8], content_type: &str) -> Result<PutResult, CoreError>;
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError>;
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), CoreError>;
}

fn etag_of(bytes: &[u8]) -> String {
    crate::domain::ids::md5_8_bytes(bytes)
}

/// An in-process object store for tests and for single-node deployments
/// without a real object-store dependency.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8], _content_type: &str) -> Result<PutResult, CoreError> {
        let etag = etag_of(bytes);
        let size = bytes.len() as u64;
        self.objects
            .lock()
            .map_err(|_| CoreError::Logic("object store mutex poisoned".into()))?
            .insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        Ok(PutResult { bucket: bucket.to_string(), key: key.to_string(), etag, size })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        self.objects
            .lock()
            .map_err(|_| CoreError::Logic("object store mutex poisoned".into()))?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| CoreError::InputInvalid(format!("no such object: {bucket}/{key}")))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), CoreError> {
        self.objects
            .lock()
            .map_err(|_| CoreError::Logic("object store mutex poisoned".into()))?
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

/// A filesystem-backed object store, rooted at `base_dir`.
pub struct FsObjectStore {
    base_dir: PathBuf,
}

impl FsObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.base_dir.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8], _content_type: &str) -> Result<PutResult, CoreError> {
        let path = self.path_for(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::ExternalTransient(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| CoreError::ExternalTransient(e.to_string()))?;
        Ok(PutResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: etag_of(bytes),
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        tokio::fs::read(self.path_for(bucket, key))
            .await
            .map_err(|e| CoreError::ExternalTransient(e.to_string()))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), CoreError> {
        let path = self.path_for(bucket, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::ExternalTransient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryObjectStore::new();
        let result = store.put("bucket", "key", b"hello", "text/plain").await.unwrap();
        assert_eq!(result.size, 5);
        let bytes = store.get("bucket", "key").await.unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn delete_then_get_errors() {
        let store = InMemoryObjectStore::new();
        store.put("b", "k", b"x", "text/plain").await.unwrap();
        store.delete("b", "k").await.unwrap();
        assert!(store.get("b", "k").await.is_err());
    }

    #[test]
    fn object_key_has_expected_shape() {
        let key = object_key(7, "report.pdf");
        assert!(key.starts_with("7/"));
        assert!(key.ends_with("/report.pdf"));
    }
}
