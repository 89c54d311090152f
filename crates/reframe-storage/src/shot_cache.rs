//! Two-tier shot detection cache.
//!
//! Shot detection decodes the whole source, which dominates analysis time for
//! long videos. Several clip renders from the same source share one cache
//! handle, so the result is computed once per (file identity, parameters).
//!
//! # Lookup order
//!
//! 1. In-process map (read-optimized `RwLock`)
//! 2. Durable blob store (gzip JSON), populating the map on hit
//! 3. Miss
//!
//! A durable entry that fails to decode is deleted and treated as a miss,
//! unless a writer replaced it in the meantime. Storage errors are logged and
//! never surface to the caller.
//!
//! The in-process map holds at most `memory_capacity` shot lists and evicts
//! the oldest insertion first. Concurrent `get_or_detect` calls for one key
//! run detection once; the others wait and read the stored result.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use reframe_models::Shot;

use crate::blob::BlobStore;
use crate::codec::{compress_json, decompress_json};
use crate::error::{StorageError, StorageResult};

/// Version of the durable entry layout.
pub const SHOT_CACHE_VERSION: u32 = 1;

/// Shot lists kept in process unless configured otherwise.
pub const DEFAULT_MEMORY_CAPACITY: usize = 256;

/// Detection parameters that change the shot list for a given source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShotDetectionParams {
    pub sample_rate: f64,
    pub shot_threshold: f64,
    pub min_shot_duration: f64,
}

/// Cache key derived from source identity and detection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShotCacheKey(String);

impl ShotCacheKey {
    /// Build a key from explicit file identity.
    pub fn from_parts(path: &Path, size: u64, mtime_nanos: u128, params: &ShotDetectionParams) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(size.to_le_bytes());
        hasher.update(mtime_nanos.to_le_bytes());
        hasher.update(params.sample_rate.to_bits().to_le_bytes());
        hasher.update(params.shot_threshold.to_bits().to_le_bytes());
        hasher.update(params.min_shot_duration.to_bits().to_le_bytes());
        Self(format!("shots-{:x}", hasher.finalize()))
    }

    /// Build a key by reading size and modification time of `path`.
    pub async fn for_source(path: &Path, params: &ShotDetectionParams) -> StorageResult<Self> {
        let meta_err = |message: String| StorageError::SourceMetadata {
            path: path.display().to_string(),
            message,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| meta_err(e.to_string()))?;
        let mtime_nanos = metadata
            .modified()
            .map_err(|e| meta_err(e.to_string()))?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);

        Ok(Self::from_parts(path, metadata.len(), mtime_nanos, params))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ShotCacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a lookup was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    MemoryHit,
    DurableHit,
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheLookup::Miss)
    }
}

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub memory_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    pub misses: AtomicU64,
    pub corrupt_entries: AtomicU64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedShots {
    version: u32,
    key: String,
    shots: Vec<Shot>,
}

/// Bounded in-process tier, evicting in insertion order.
struct MemoryTier {
    entries: HashMap<ShotCacheKey, Arc<Vec<Shot>>>,
    order: VecDeque<ShotCacheKey>,
    capacity: usize,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn get(&self, key: &ShotCacheKey) -> Option<Arc<Vec<Shot>>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: ShotCacheKey, shots: Vec<Shot>) {
        if self.entries.insert(key.clone(), Arc::new(shots)).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            debug!(key = %oldest, "Evicted shot cache entry from memory");
        }
    }

    fn remove(&mut self, key: &ShotCacheKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

/// Shared, internally synchronized shot detection cache.
///
/// Construct once and pass an `Arc<ShotDetectionCache>` to every reframer
/// working on the same sources.
pub struct ShotDetectionCache {
    memory: RwLock<MemoryTier>,
    store: Option<Arc<dyn BlobStore>>,
    /// Serializes durable-store writes and deletes
    write_lock: Mutex<()>,
    /// One gate per key with a detection in progress
    inflight: Mutex<HashMap<ShotCacheKey, Arc<Mutex<()>>>>,
    stats: CacheStats,
}

impl ShotDetectionCache {
    /// Cache with only the in-process tier.
    pub fn in_memory() -> Self {
        Self {
            memory: RwLock::new(MemoryTier::new(DEFAULT_MEMORY_CAPACITY)),
            store: None,
            write_lock: Mutex::new(()),
            inflight: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Keep at most `capacity` shot lists in process (minimum one).
    pub fn with_memory_capacity(mut self, capacity: usize) -> Self {
        self.memory = RwLock::new(MemoryTier::new(capacity));
        self
    }

    /// Cache backed by a durable blob store.
    pub fn with_store(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::in_memory()
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Look up shots for `key`.
    pub async fn get(&self, key: &ShotCacheKey) -> (Option<Vec<Shot>>, CacheLookup) {
        if let Some(shots) = self.memory_hit(key).await {
            return (Some(shots), CacheLookup::MemoryHit);
        }

        if let Some(shots) = self.load_durable(key).await {
            self.memory.write().await.insert(key.clone(), shots.clone());
            self.stats.durable_hits.fetch_add(1, Ordering::Relaxed);
            counter!("reframe_shot_cache_hits_total", "tier" => "durable").increment(1);
            info!(key = %key, shots = shots.len(), "Shot cache durable hit");
            return (Some(shots), CacheLookup::DurableHit);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        counter!("reframe_shot_cache_misses_total").increment(1);
        (None, CacheLookup::Miss)
    }

    async fn memory_hit(&self, key: &ShotCacheKey) -> Option<Vec<Shot>> {
        let shots = self.memory.read().await.get(key)?;
        self.stats.memory_hits.fetch_add(1, Ordering::Relaxed);
        counter!("reframe_shot_cache_hits_total", "tier" => "memory").increment(1);
        debug!(key = %key, "Shot cache memory hit");
        Some((*shots).clone())
    }

    /// Store shots for `key` in both tiers.
    pub async fn put(&self, key: &ShotCacheKey, shots: &[Shot]) {
        self.memory.write().await.insert(key.clone(), shots.to_vec());

        let Some(store) = &self.store else {
            return;
        };

        let entry = CachedShots {
            version: SHOT_CACHE_VERSION,
            key: key.as_str().to_string(),
            shots: shots.to_vec(),
        };
        let bytes = match compress_json(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode shot cache entry");
                return;
            }
        };

        let _guard = self.write_lock.lock().await;
        match store.put(key.as_str(), bytes).await {
            Ok(()) => debug!(key = %key, shots = shots.len(), "Stored shot cache entry"),
            Err(e) => warn!(key = %key, error = %e, "Failed to persist shot cache entry"),
        }
    }

    /// Return cached shots or run `detect` and cache its result.
    ///
    /// Callers racing on the same key wait for the first detection instead
    /// of repeating it. Errors from `detect` are returned unchanged and
    /// nothing is cached; a waiting caller then runs its own detection.
    pub async fn get_or_detect<F, Fut, E>(
        &self,
        key: &ShotCacheKey,
        detect: F,
    ) -> Result<(Vec<Shot>, CacheLookup), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Shot>, E>>,
    {
        if let Some(shots) = self.memory_hit(key).await {
            return Ok((shots, CacheLookup::MemoryHit));
        }

        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _turn = gate.lock().await;
            match self.get(key).await {
                (Some(shots), lookup) => Ok((shots, lookup)),
                (None, _) => match detect().await {
                    Ok(shots) => {
                        self.put(key, &shots).await;
                        Ok((shots, CacheLookup::Miss))
                    }
                    Err(e) => Err(e),
                },
            }
        };

        // Gates are cloned and dropped under this lock, so the count is exact
        let mut inflight = self.inflight.lock().await;
        drop(gate);
        if inflight.get(key).is_some_and(|g| Arc::strong_count(g) == 1) {
            inflight.remove(key);
        }
        result
    }

    /// Drop `key` from both tiers.
    pub async fn invalidate(&self, key: &ShotCacheKey) {
        self.memory.write().await.remove(key);
        self.delete_durable(key).await;
    }

    async fn load_durable(&self, key: &ShotCacheKey) -> Option<Vec<Shot>> {
        let store = self.store.as_ref()?;

        let data = match store.get(key.as_str()).await {
            Ok(Some(data)) => data,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %key, error = %e, "Shot cache store read failed, treating as miss");
                return None;
            }
        };

        match decode_entry(key, &data) {
            Ok(shots) => Some(shots),
            Err(e) => {
                self.stats.corrupt_entries.fetch_add(1, Ordering::Relaxed);
                counter!("reframe_shot_cache_corrupt_total").increment(1);
                warn!(key = %key, error = %e, "Discarding corrupt shot cache entry");
                self.discard_corrupt(key, &data).await;
                None
            }
        }
    }

    /// Delete the durable entry only if it still holds `corrupt`.
    async fn discard_corrupt(&self, key: &ShotCacheKey, corrupt: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        match store.get(key.as_str()).await {
            Ok(Some(current)) if current == corrupt => {
                if let Err(e) = store.delete(key.as_str()).await {
                    warn!(key = %key, error = %e, "Failed to delete shot cache entry");
                }
            }
            Ok(_) => debug!(key = %key, "Corrupt shot cache entry was already replaced"),
            Err(e) => warn!(key = %key, error = %e, "Shot cache store read failed, keeping entry"),
        }
    }

    async fn delete_durable(&self, key: &ShotCacheKey) {
        let Some(store) = &self.store else {
            return;
        };
        let _guard = self.write_lock.lock().await;
        if let Err(e) = store.delete(key.as_str()).await {
            warn!(key = %key, error = %e, "Failed to delete shot cache entry");
        }
    }
}

fn decode_entry(key: &ShotCacheKey, data: &[u8]) -> StorageResult<Vec<Shot>> {
    let entry: CachedShots = decompress_json(key.as_str(), data)?;
    if entry.version != SHOT_CACHE_VERSION {
        return Err(StorageError::corruption(
            key.as_str(),
            format!("version {} (expected {})", entry.version, SHOT_CACHE_VERSION),
        ));
    }
    if entry.key != key.as_str() {
        return Err(StorageError::corruption(key.as_str(), "entry stored under a different key"));
    }
    if entry.shots.iter().any(|s| !(s.end_time > s.start_time)) {
        return Err(StorageError::corruption(key.as_str(), "shot with empty time range"));
    }
    Ok(entry.shots)
}
