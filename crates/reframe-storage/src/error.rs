//! Storage error types.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// A stored entry could not be decoded. The cache discards such entries.
    #[error("Corrupt cache entry {key}: {message}")]
    CacheCorruption { key: String, message: String },

    #[error("Source metadata unavailable for {path}: {message}")]
    SourceMetadata { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::InvalidKey(key.into())
    }

    pub fn corruption(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CacheCorruption {
            key: key.into(),
            message: message.into(),
        }
    }
}
