//! Filesystem-based object storage.
//!
//! Containers are directories under a base path and objects are files:
//! ```text
//! {base_path}/
//!   {container}/
//!     session-{sessionId}.json
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use super::{ErrorCode, ObjectStore, Result, StoreError, StoreType};

/// Filesystem-based object store.
pub struct FilesystemObjectStore {
    base_path: PathBuf,
}

impl FilesystemObjectStore {
    /// Create a new filesystem object store.
    ///
    /// Creates the base directory if it doesn't exist.
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn container_path(&self, container: &str) -> Result<PathBuf> {
        validate_name(container)?;
        Ok(self.base_path.join(container))
    }

    fn object_path(&self, container: &str, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.container_path(container)?.join(name))
    }
}

/// Names map directly onto path segments, so anything that could escape
/// the base directory is refused.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(StoreError::service(
            400,
            ErrorCode::InvalidResourceName,
            format!("Invalid resource name: {:?}", name),
        ));
    }
    Ok(())
}

/// Map I/O failures onto service errors where the kind is unambiguous.
fn map_io(err: std::io::Error, missing: ErrorCode) -> StoreError {
    match err.kind() {
        ErrorKind::NotFound => StoreError::service(404, missing, err.to_string()),
        ErrorKind::PermissionDenied => {
            StoreError::service(403, ErrorCode::AuthorizationFailure, err.to_string())
        }
        ErrorKind::AlreadyExists => {
            StoreError::service(409, ErrorCode::ContainerAlreadyExists, err.to_string())
        }
        _ => StoreError::Io(err),
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn container_exists(&self, container: &str) -> Result<bool> {
        let path = self.container_path(container)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_dir()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(e, ErrorCode::ContainerNotFound)),
        }
    }

    async fn create_container(&self, container: &str) -> Result<()> {
        let path = self.container_path(container)?;
        fs::create_dir(&path)
            .await
            .map_err(|e| map_io(e, ErrorCode::ContainerNotFound))
    }

    async fn exists(&self, container: &str, name: &str) -> Result<bool> {
        let path = self.object_path(container, name)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(map_io(e, ErrorCode::ObjectNotFound)),
        }
    }

    async fn delete(&self, container: &str, name: &str) -> Result<()> {
        let path = self.object_path(container, name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| map_io(e, ErrorCode::ObjectNotFound))?;
        debug!(path = %path.display(), "Deleted object");
        Ok(())
    }

    async fn put(&self, container: &str, name: &str, body: &[u8]) -> Result<()> {
        let path = self.object_path(container, name)?;

        // Write atomically using temp file + rename. The temp name is unique
        // per write so concurrent writers of one object never share it.
        let temp_path = self
            .container_path(container)?
            .join(format!(".{}.{}.tmp", name, Uuid::new_v4()));
        let written = match fs::write(&temp_path, body).await {
            Ok(()) => fs::rename(&temp_path, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(map_io(e, ErrorCode::ContainerNotFound));
        }

        debug!(path = %path.display(), size = body.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(container, name)?;
        fs::read(&path)
            .await
            .map_err(|e| map_io(e, ErrorCode::ObjectNotFound))
    }

    fn store_type(&self) -> StoreType {
        StoreType::Filesystem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_temp_store() -> (FilesystemObjectStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemObjectStore::new(temp_dir.path()).await.unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let (store, _temp) = create_temp_store().await;

        assert!(!store.container_exists("orders").await.unwrap());
        store.create_container("orders").await.unwrap();
        assert!(store.container_exists("orders").await.unwrap());

        let err = store.create_container("orders").await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::ContainerAlreadyExists));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (store, _temp) = create_temp_store().await;
        store.create_container("orders").await.unwrap();

        store.put("orders", "session-a.json", b"{}").await.unwrap();
        assert!(store.exists("orders", "session-a.json").await.unwrap());
        assert_eq!(store.get("orders", "session-a.json").await.unwrap(), b"{}");

        store.delete("orders", "session-a.json").await.unwrap();
        assert!(!store.exists("orders", "session-a.json").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (store, _temp) = create_temp_store().await;
        store.create_container("orders").await.unwrap();

        store.put("orders", "session-a.json", b"first").await.unwrap();
        store.put("orders", "session-a.json", b"second").await.unwrap();

        assert_eq!(
            store.get("orders", "session-a.json").await.unwrap(),
            b"second"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_to_one_object() {
        let (store, temp) = create_temp_store().await;
        store.create_container("orders").await.unwrap();
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .put("orders", "session-a.json", format!("v{}", i).as_bytes())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let body = store.get("orders", "session-a.json").await.unwrap();
        assert!(String::from_utf8(body).unwrap().starts_with('v'));

        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("orders"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("session-a.json")]);
    }

    #[tokio::test]
    async fn test_put_without_container_is_fatal() {
        let (store, _temp) = create_temp_store().await;

        let err = store.put("missing", "session-a.json", b"{}").await.unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_not_found() {
        let (store, _temp) = create_temp_store().await;
        store.create_container("orders").await.unwrap();

        let err = store.get("orders", "session-none.json").await.unwrap_err();
        assert_eq!(err.code(), Some(&ErrorCode::ObjectNotFound));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let (store, _temp) = create_temp_store().await;
        store.create_container("orders").await.unwrap();

        for name in ["../escape.json", "a/b.json", "..", ""] {
            let err = store.put("orders", name, b"{}").await.unwrap_err();
            assert_eq!(err.code(), Some(&ErrorCode::InvalidResourceName));
            assert!(!err.is_retryable());
        }
    }
}
