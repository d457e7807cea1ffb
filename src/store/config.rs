//! Object store configuration.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::event::non_blank;

/// How an existing snapshot is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Check existence, delete, then write a fresh object.
    #[default]
    DeleteThenWrite,
    /// Single create-or-overwrite write, for stores that replace atomically.
    Overwrite,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Connection descriptor: `file://{dir}`, `memory://` or `s3://`.
    pub connection: Option<String>,

    /// Container (directory, bucket) that receives snapshots.
    pub container: Option<String>,

    /// Replace strategy for existing snapshots.
    pub replace: ReplaceStrategy,

    /// S3 store configuration (requires `s3` feature).
    #[cfg(feature = "s3")]
    pub s3: S3StoreConfig,
}

impl StorageConfig {
    pub fn connection(&self) -> Option<&str> {
        non_blank(self.connection.as_deref())
    }

    pub fn container(&self) -> Option<&str> {
        non_blank(self.container.as_deref())
    }

    pub fn is_configured(&self) -> bool {
        self.connection().is_some() && self.container().is_some()
    }
}

/// S3 object store configuration.
#[cfg(feature = "s3")]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3StoreConfig {
    /// AWS region.
    pub region: Option<String>,
    /// Custom endpoint URL (for S3-compatible services like MinIO).
    pub endpoint: Option<String>,
}

#[derive(Debug, Error)]
#[error("Unsupported storage connection: {0}")]
pub struct UnsupportedConnection(pub String);

/// Backend selected by a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Filesystem(PathBuf),
    Memory,
    S3,
}

impl StoreLocation {
    pub fn parse(connection: &str) -> Result<Self, UnsupportedConnection> {
        let connection = connection.trim();
        if let Some(path) = connection.strip_prefix("file://") {
            if path.is_empty() {
                return Err(UnsupportedConnection(connection.to_string()));
            }
            return Ok(StoreLocation::Filesystem(PathBuf::from(path)));
        }
        if connection.starts_with("memory://") {
            return Ok(StoreLocation::Memory);
        }
        if connection.starts_with("s3://") {
            return Ok(StoreLocation::S3);
        }
        Err(UnsupportedConnection(connection.to_string()))
    }
}
