//! Blob-style object storage for order snapshots.
//!
//! Snapshots are stored one object per session, named
//! `session-{sessionId}.json`, inside a single configured container.
//! Writing the same session again replaces the previous snapshot
//! (last write wins).
//!
//! ## Storage Backends
//!
//! - `FilesystemObjectStore` - containers are directories, objects are files
//! - `MemoryObjectStore` - in-process map, with fault injection for tests
//! - `S3ObjectStore` (feature: s3) - Amazon S3 or any S3-compatible service
//!
//! ## Error Classification
//!
//! Every backend maps its failures onto `StoreError`. Service errors carry
//! a status and an `ErrorCode`; `StoreError::is_retryable` decides whether a
//! failed attempt is worth repeating.

mod config;
mod filesystem;
mod memory;
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use config::S3StoreConfig;
pub use config::{ReplaceStrategy, StorageConfig, StoreLocation};
pub use filesystem::FilesystemObjectStore;
pub use memory::{Fault, MemoryObjectStore, StoreOp};
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Service-level error codes understood by the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    ServerBusy,
    InternalError,
    OperationTimedOut,
    ContainerAlreadyExists,
    ContainerNotFound,
    ObjectNotFound,
    AuthorizationFailure,
    InvalidResourceName,
    Other(String),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::ServerBusy => f.write_str("ServerBusy"),
            ErrorCode::InternalError => f.write_str("InternalError"),
            ErrorCode::OperationTimedOut => f.write_str("OperationTimedOut"),
            ErrorCode::ContainerAlreadyExists => f.write_str("ContainerAlreadyExists"),
            ErrorCode::ContainerNotFound => f.write_str("ContainerNotFound"),
            ErrorCode::ObjectNotFound => f.write_str("ObjectNotFound"),
            ErrorCode::AuthorizationFailure => f.write_str("AuthorizationFailure"),
            ErrorCode::InvalidResourceName => f.write_str("InvalidResourceName"),
            ErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// Errors that can occur during object store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage service answered with an error.
    #[error("{code} (status {status}): {message}")]
    Service {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The request never produced a service response.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for object store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn service(status: u16, code: ErrorCode, message: impl Into<String>) -> Self {
        StoreError::Service {
            status,
            code,
            message: message.into(),
        }
    }

    /// Whether repeating the failed operation may succeed.
    ///
    /// Busy, internal-error and timeout codes and any 5xx status are
    /// transient. Other service errors are fatal. Failures without a service
    /// classification (I/O, transport) are treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Service { status, code, .. } => {
                matches!(
                    code,
                    ErrorCode::ServerBusy | ErrorCode::InternalError | ErrorCode::OperationTimedOut
                ) || *status >= 500
            }
            StoreError::Io(_) | StoreError::Transport(_) => true,
        }
    }

    /// Service status, when the error came from the service.
    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Service { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Service error code, when the error came from the service.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            StoreError::Service { code, .. } => Some(code),
            _ => None,
        }
    }
}

/// Kind of object store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    Filesystem,
    Memory,
    S3,
}

/// Client for a blob-style object store.
///
/// Implementations hold no per-call state, so one client may be shared by
/// any number of concurrent invocations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn container_exists(&self, container: &str) -> Result<bool>;

    /// Create a container. Fails with `ContainerAlreadyExists` if present.
    async fn create_container(&self, container: &str) -> Result<()>;

    async fn exists(&self, container: &str, name: &str) -> Result<bool>;

    async fn delete(&self, container: &str, name: &str) -> Result<()>;

    /// Write an object, creating or overwriting it.
    async fn put(&self, container: &str, name: &str, body: &[u8]) -> Result<()>;

    async fn get(&self, container: &str, name: &str) -> Result<Vec<u8>>;

    /// Storage type for this backend.
    fn store_type(&self) -> StoreType;
}

/// Where snapshots go: a store client, a container and a replace strategy.
#[derive(Clone)]
pub struct SnapshotTarget {
    store: Arc<dyn ObjectStore>,
    container: String,
    strategy: ReplaceStrategy,
}

impl fmt::Debug for SnapshotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotTarget")
            .field("store", &self.store.store_type())
            .field("container", &self.container)
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl SnapshotTarget {
    pub fn new(store: Arc<dyn ObjectStore>, container: impl Into<String>) -> Self {
        Self {
            store,
            container: container.into(),
            strategy: ReplaceStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn strategy(&self) -> ReplaceStrategy {
        self.strategy
    }

    /// Create the container if absent. A concurrent creator winning the
    /// race is not an error.
    pub async fn ensure_container(&self) -> Result<()> {
        if self.store.container_exists(&self.container).await? {
            return Ok(());
        }

        info!(container = %self.container, "Creating container");
        match self.store.create_container(&self.container).await {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some(&ErrorCode::ContainerAlreadyExists) => {
                debug!(container = %self.container, "Container created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the snapshot stored under `name` with `body`.
    ///
    /// One attempt: ensure the container, then write according to the
    /// configured strategy. With `DeleteThenWrite` there is a window in
    /// which the object is absent; concurrent writers to the same name race.
    pub async fn replace(&self, name: &str, body: &[u8]) -> Result<()> {
        self.ensure_container().await?;

        if self.strategy == ReplaceStrategy::DeleteThenWrite
            && self.store.exists(&self.container, name).await?
        {
            debug!(object = %name, "Deleting existing snapshot");
            match self.store.delete(&self.container, name).await {
                Ok(()) => {}
                Err(e) if e.code() == Some(&ErrorCode::ObjectNotFound) => {
                    debug!(object = %name, "Snapshot deleted concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        self.store.put(&self.container, name, body).await
    }

    /// Read back a stored snapshot.
    pub async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.store.get(&self.container, name).await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the snapshot target based on configuration.
///
/// Returns `None` when the connection or container is not configured; the
/// endpoints report that per invocation rather than refusing to start.
///
/// # Errors
///
/// Returns error if the connection names an unknown scheme or a backend
/// whose feature is not compiled in.
pub async fn init_snapshot_target(
    config: &StorageConfig,
) -> std::result::Result<Option<SnapshotTarget>, Box<dyn std::error::Error + Send + Sync>> {
    let (Some(connection), Some(container)) = (config.connection(), config.container()) else {
        tracing::warn!("Storage connection or container not configured");
        return Ok(None);
    };

    let store: Arc<dyn ObjectStore> = match StoreLocation::parse(connection)? {
        StoreLocation::Filesystem(base_path) => {
            info!(path = %base_path.display(), "ObjectStore: filesystem");
            Arc::new(FilesystemObjectStore::new(&base_path).await?)
        }
        StoreLocation::Memory => {
            info!("ObjectStore: memory");
            Arc::new(MemoryObjectStore::new())
        }
        StoreLocation::S3 => {
            #[cfg(feature = "s3")]
            {
                info!(
                    region = ?config.s3.region,
                    endpoint = ?config.s3.endpoint,
                    "ObjectStore: s3"
                );
                Arc::new(S3ObjectStore::from_config(&config.s3).await)
            }

            #[cfg(not(feature = "s3"))]
            {
                return Err("S3 support requires the 's3' feature. Rebuild with --features s3".into());
            }
        }
    };

    Ok(Some(
        SnapshotTarget::new(store, container).with_strategy(config.replace),
    ))
}
