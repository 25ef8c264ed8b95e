pub mod local;

pub use local::LocalObjectStore;

use async_trait::async_trait;
use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Object not found: {path}")]
    NotFound { path: String },

    #[error("Invalid object path: {path}")]
    InvalidPath { path: String },

    #[error("Storage operation timed out after {seconds}s")]
    Timeout { seconds: u64 },
}

/// Binary object store holding originals and thumbnails.
///
/// Paths are opaque, slash-separated keys relative to the store root.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `bytes` at `path`, replacing any existing object, and return the stored path.
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove every listed object. Missing objects are not an error.
    async fn remove(&self, paths: &[String]) -> Result<(), StorageError>;

    /// Publicly fetchable URL for a stored path.
    fn public_url(&self, path: &str) -> String;
}

/// Owner-namespaced key for a freshly uploaded original.
pub fn original_object_path(owner_id: &str, filename: &str) -> String {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string());

    format!(
        "{}/{}-{}.{}",
        owner_id,
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

/// Key of the thumbnail derived from `original_path`.
pub fn thumbnail_object_path(original_path: &str) -> String {
    format!("thumbnails/{}", original_path)
}

/// Run a store operation with an upper bound on how long it may take.
pub async fn with_timeout<T, F>(limit: Duration, operation: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            seconds: limit.as_secs(),
        }),
    }
}
