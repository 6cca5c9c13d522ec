use std::any::Any;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use strata_types::{BlobProperties, BlobUpdateContext, OptionalOrUnknown};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::key::KeyStrategy;
use crate::local::LocalBlobStore;
use crate::traits::{BlobInfo, BlobStore, BlobStream};
use crate::write::BlobWriteContext;

/// Limits of the local file cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total bytes kept before eviction starts.
    pub max_size: u64,
    /// Number of files kept before eviction starts.
    pub max_count: usize,
    /// Files younger than this are never evicted.
    pub min_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1024 * 1024 * 1024,
            max_count: 10_000,
            min_age: Duration::from_secs(3600),
        }
    }
}

/// Outcome of one eviction pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub count: usize,
    pub size: u64,
    pub evicted: usize,
}

/// Decorator keeping a local file cache in front of a slower store.
///
/// Writes land in the cache first and are then pushed to the inner store;
/// reads are served from the cache, filling it on a miss. The inner store
/// stays authoritative for existence, properties, and listing.
pub struct CachingBlobStore {
    name: String,
    inner: Arc<dyn BlobStore>,
    cache: LocalBlobStore,
    config: CacheConfig,
}

impl CachingBlobStore {
    pub fn new(
        name: impl Into<String>,
        inner: Arc<dyn BlobStore>,
        cache_dir: &Path,
        config: CacheConfig,
    ) -> StoreResult<Self> {
        let name = name.into();
        let cache = LocalBlobStore::open(format!("{name}-cache"), cache_dir, inner.key_strategy().clone())?;
        Ok(Self {
            name,
            inner,
            cache,
            config,
        })
    }

    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.inner
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether `key` currently has a cached copy.
    pub fn is_cached(&self, key: &str) -> bool {
        self.cache.get_file(key).map(|f| f.is_present()).unwrap_or(false)
    }

    /// Cached file for `key`, fetching it from the inner store on a miss.
    /// `None` if the inner store does not have it either, or if the key
    /// cannot be cached.
    fn cached_file(&self, key: &str) -> StoreResult<Option<PathBuf>> {
        if !self.cache.path_strategy().is_valid_key(key) {
            return Ok(None);
        }
        if let OptionalOrUnknown::Present(path) = self.cache.get_file(key)? {
            return Ok(Some(path));
        }
        // make room first so the fresh entry survives this pass
        self.evict_quietly();
        if !self.cache.copy_blob(key, self.inner.as_ref(), key, false)? {
            return Ok(None);
        }
        debug!(store = %self.name, key, "cache filled");
        Ok(self.cache.get_file(key)?.present())
    }

    /// Evict least-recently-modified files until the cache is back within
    /// `max_size` and `max_count`. Files younger than `min_age` are kept.
    pub fn clear_old_blobs(&self) -> StoreResult<CacheStats> {
        let now = SystemTime::now();
        let mut entries = Vec::new();
        for info in self.cache.list_blobs()? {
            let OptionalOrUnknown::Present(path) = self.cache.get_file(&info.key)? else {
                continue;
            };
            let modified = fs::metadata(&path)?.modified()?;
            entries.push((modified, info.key, info.length));
        }
        entries.sort();

        let mut stats = CacheStats {
            count: entries.len(),
            size: entries.iter().map(|(_, _, len)| len).sum(),
            evicted: 0,
        };
        for (modified, key, length) in entries {
            if stats.size <= self.config.max_size && stats.count <= self.config.max_count {
                break;
            }
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.config.min_age {
                // sorted oldest first: everything after is younger still
                break;
            }
            self.cache.delete_blob(&key)?;
            stats.count -= 1;
            stats.size -= length;
            stats.evicted += 1;
        }
        if stats.evicted > 0 {
            debug!(store = %self.name, evicted = stats.evicted, count = stats.count, size = stats.size, "cache eviction");
        }
        Ok(stats)
    }

    fn evict_quietly(&self) {
        if let Err(e) = self.clear_old_blobs() {
            warn!(store = %self.name, error = %e, "cache eviction failed");
        }
    }

    fn uncache(&self, key: &str) {
        if !self.cache.path_strategy().is_valid_key(key) {
            return;
        }
        if let Err(e) = self.cache.delete_blob(key) {
            warn!(store = %self.name, key, error = %e, "failed to drop cached copy");
        }
    }
}

impl BlobStore for CachingBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_strategy(&self) -> &KeyStrategy {
        self.inner.key_strategy()
    }

    fn has_versioning(&self) -> bool {
        self.inner.has_versioning()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String> {
        let key = ctx.storage_key().ok();
        // Keys known upfront may be invalid for the cache layout; write through.
        if key.is_some_and(|k| !self.cache.path_strategy().is_valid_key(&k)) {
            return self.inner.write_blob(ctx);
        }
        let cached = self.cache.write_blob(ctx)?;
        let OptionalOrUnknown::Present(path) = self.cache.get_file(&cached)? else {
            return Err(StoreError::NotFound(cached));
        };
        let mut upstream = BlobWriteContext::from_file(cached.as_str(), &path)?;
        let written = self.inner.write_blob(&mut upstream)?;
        if written != cached {
            // versioned upstream key: the cached copy would never be hit
            self.uncache(&cached);
        }
        self.evict_quietly();
        Ok(written)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        match self.cached_file(key)? {
            Some(path) => Ok(OptionalOrUnknown::Present(Box::new(fs::File::open(path)?))),
            None if self.cache.path_strategy().is_valid_key(key) => Ok(OptionalOrUnknown::Missing),
            None => self.inner.get_stream(key),
        }
    }

    fn get_file(&self, key: &str) -> StoreResult<OptionalOrUnknown<PathBuf>> {
        match self.cached_file(key)? {
            Some(path) => Ok(OptionalOrUnknown::Present(path)),
            None if self.cache.path_strategy().is_valid_key(key) => Ok(OptionalOrUnknown::Missing),
            None => self.inner.get_file(key),
        }
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        match self.cached_file(key)? {
            Some(path) => {
                fs::copy(path, dest)?;
                Ok(true)
            }
            None if self.cache.path_strategy().is_valid_key(key) => Ok(false),
            None => self.inner.read_blob(key, dest),
        }
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.inner.delete_blob(key)?;
        self.uncache(key);
        Ok(())
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        match source.as_any().downcast_ref::<CachingBlobStore>() {
            Some(other) => self.inner.copy_blob_is_optimized(other.inner.as_ref()),
            None => self.inner.copy_blob_is_optimized(source),
        }
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        let found = match source.as_any().downcast_ref::<CachingBlobStore>() {
            Some(other) => {
                let found = self
                    .inner
                    .copy_blob(key, other.inner.as_ref(), source_key, atomic_move)?;
                if atomic_move {
                    other.uncache(source_key);
                }
                found
            }
            None => self.inner.copy_blob(key, source, source_key, atomic_move)?,
        };
        // non-digest keys may now name different bytes
        self.uncache(key);
        Ok(found)
    }

    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()> {
        self.inner.write_blob_properties(update)
    }

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties> {
        self.inner.blob_properties(key)
    }

    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        self.inner.list_blobs()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for CachingBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingBlobStore")
            .field("name", &self.name)
            .field("inner", &self.inner.name())
            .field("cache_root", &self.cache.root())
            .field("config", &self.config)
            .finish()
    }
}
