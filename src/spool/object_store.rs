//! Object Store Abstraction
//!
//! The only thing the spool needs from a remote store is "put this stream
//! under this bucket and key". Everything else about the wire protocol lives
//! behind the `ObjectStore` trait.
//!
//! Implementations:
//! - `InMemoryObjectStore`: for unit tests and simulation
//! - `LocalFsObjectStore`: one directory per bucket, for development
//! - `S3ObjectStore`: for production (feature `s3`)
//! - `SimulatedObjectStore`: fault-injecting wrapper over any of the above

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Per-object metadata sent with every upload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Exact byte length of the body
    pub content_length: u64,
    /// Server-side encryption algorithm, e.g. "AES256"
    pub server_side_encryption: Option<String>,
}

/// Error type for object store operations
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object or bucket not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// Transient failure, worth retrying
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Other(String),
}

/// Remote object store
pub trait ObjectStore: Send + Sync + 'static {
    /// Store the whole of `body` as `bucket/key`, replacing any existing
    /// object. `metadata.content_length` is the exact body length.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError>;

    /// Release client resources. Called once when the output stops.
    fn shutdown(&self) {}
}

impl<S: ObjectStore + ?Sized> ObjectStore for Arc<S> {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        (**self).put_object(bucket, key, body, metadata)
    }

    fn shutdown(&self) {
        (**self).shutdown()
    }
}

/// Read exactly `content_length` bytes, failing on a short or long body
pub(crate) fn read_body(
    body: &mut dyn Read,
    metadata: &ObjectMetadata,
) -> Result<Vec<u8>, ObjectStoreError> {
    let mut data = Vec::with_capacity(metadata.content_length as usize);
    body.read_to_end(&mut data)?;
    if data.len() as u64 != metadata.content_length {
        return Err(ObjectStoreError::Other(format!(
            "body length {} does not match content length {}",
            data.len(),
            metadata.content_length
        )));
    }
    Ok(data)
}

// ============================================================================
// InMemoryObjectStore - For tests and simulation
// ============================================================================

/// A stored object with the metadata it was uploaded with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub server_side_encryption: Option<String>,
}

/// In-memory object store. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<(String, String), StoredObject>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// All objects of `bucket` by key
    pub fn objects(&self, bucket: &str) -> BTreeMap<String, Bytes> {
        self.objects
            .read()
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, k), object)| (k.clone(), object.data.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let data = read_body(body, metadata)?;
        self.objects.write().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: Bytes::from(data),
                server_side_encryption: metadata.server_side_encryption.clone(),
            },
        );
        Ok(())
    }
}

// ============================================================================
// LocalFsObjectStore - For development
// ============================================================================

/// Stores `bucket/key` at `{base}/{bucket}/{key}`
#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    base_path: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsObjectStore { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve an object path, refusing anything that would escape the base
    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        let relative = Path::new(bucket).join(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes || bucket.is_empty() || key.is_empty() {
            return Err(ObjectStoreError::Other(format!(
                "invalid object path {}/{}",
                bucket, key
            )));
        }
        Ok(self.base_path.join(relative))
    }
}

impl ObjectStore for LocalFsObjectStore {
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: &mut dyn Read,
        metadata: &ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write to a sibling temp file and rename so readers never see a
        // partial object
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let result = (|| -> Result<(), ObjectStoreError> {
            let mut file = std::fs::File::create(&tmp)?;
            let copied = std::io::copy(body, &mut file)?;
            if copied != metadata.content_length {
                return Err(ObjectStoreError::Other(format!(
                    "body length {} does not match content length {}",
                    copied, metadata.content_length
                )));
            }
            file.flush()?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            match std::fs::remove_file(&tmp) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %tmp.display(), error = %e, "Failed to remove temp object"),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(len: usize) -> ObjectMetadata {
        ObjectMetadata {
            content_length: len as u64,
            server_side_encryption: None,
        }
    }

    #[test]
    fn test_in_memory_put_and_get() {
        let store = InMemoryObjectStore::new();
        let data = b"hello world";
        store
            .put_object("b", "logs/a.data", &mut &data[..], &meta(data.len()))
            .unwrap();

        let object = store.get("b", "logs/a.data").unwrap();
        assert_eq!(&object.data[..], data);
        assert_eq!(store.keys("b"), vec!["logs/a.data".to_string()]);
        assert!(store.keys("other").is_empty());
        assert!(store.get("other", "logs/a.data").is_none());
    }

    #[test]
    fn test_in_memory_records_encryption_and_overwrites() {
        let store = InMemoryObjectStore::new();
        let clone = store.clone();
        let metadata = ObjectMetadata {
            content_length: 3,
            server_side_encryption: Some("AES256".to_string()),
        };

        store.put_object("b", "k", &mut &b"one"[..], &metadata).unwrap();
        store.put_object("b", "k", &mut &b"two"[..], &metadata).unwrap();

        let object = clone.get("b", "k").unwrap();
        assert_eq!(&object.data[..], b"two");
        assert_eq!(object.server_side_encryption.as_deref(), Some("AES256"));
        assert_eq!(clone.len(), 1);
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let store = InMemoryObjectStore::new();
        let err = store
            .put_object("b", "k", &mut &b"short"[..], &meta(10))
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::Other(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_local_fs_layout() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());
        let data = b"line\n";

        store
            .put_object("bucket", "a/b/c.data", &mut &data[..], &meta(data.len()))
            .unwrap();

        let path = dir.path().join("bucket").join("a/b/c.data");
        assert_eq!(std::fs::read(path).unwrap(), data);
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path().join("bucket/a/b")).unwrap().count(), 1);
    }

    #[test]
    fn test_local_fs_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        assert!(store.object_path("bucket", "../outside").is_err());
        assert!(store.object_path("bucket", "/abs").is_err());
        assert!(store.object_path("", "k").is_err());
    }

    #[test]
    fn test_local_fs_failed_put_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let store = LocalFsObjectStore::new(dir.path().to_path_buf());

        assert!(store
            .put_object("bucket", "k.data", &mut &b"abc"[..], &meta(99))
            .is_err());
        assert_eq!(std::fs::read_dir(dir.path().join("bucket")).unwrap().count(), 0);
    }

    #[test]
    fn test_arc_store_delegates() {
        let store = Arc::new(InMemoryObjectStore::new());
        let shared: Arc<dyn ObjectStore> = store.clone();
        shared.put_object("b", "k", &mut &b"x"[..], &meta(1)).unwrap();
        assert_eq!(store.len(), 1);
    }
}
