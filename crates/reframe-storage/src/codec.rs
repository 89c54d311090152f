//! Gzip-compressed JSON encoding for cached entries.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StorageError, StorageResult};

/// Serialize `value` to JSON and gzip it.
pub fn compress_json<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    let json = serde_json::to_vec(value)
        .map_err(|e| StorageError::Serialization(format!("Failed to serialize entry: {}", e)))?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| StorageError::Serialization(format!("Failed to gzip entry: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| StorageError::Serialization(format!("Failed to finish gzip encoding: {}", e)))
}

/// Decode bytes written by [`compress_json`].
///
/// Any failure is reported as [`StorageError::CacheCorruption`] for `key`.
pub fn decompress_json<T: DeserializeOwned>(key: &str, data: &[u8]) -> StorageResult<T> {
    let mut decoder = GzDecoder::new(data);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| StorageError::corruption(key, format!("gzip: {}", e)))?;

    serde_json::from_slice(&json).map_err(|e| StorageError::corruption(key, format!("json: {}", e)))
}
