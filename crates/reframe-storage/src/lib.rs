//! Storage for the reframing pipeline.
//!
//! This crate provides:
//! - A durable per-key blob store abstraction with a filesystem backend
//! - Gzip-compressed JSON encoding for cached entries
//! - The two-tier shot detection cache shared across concurrent analyses

pub mod blob;
pub mod codec;
pub mod error;
pub mod shot_cache;

pub use blob::{BlobStore, FsBlobStore};
pub use codec::{compress_json, decompress_json};
pub use error::{StorageError, StorageResult};
pub use shot_cache::{
    CacheLookup, CacheStats, ShotCacheKey, ShotDetectionCache, ShotDetectionParams,
    DEFAULT_MEMORY_CAPACITY, SHOT_CACHE_VERSION,
};
