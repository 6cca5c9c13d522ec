use std::any::Any;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::RwLock;

use bytes::Bytes;
use chrono::Utc;
use strata_types::{BlobProperties, BlobUpdateContext, OptionalOrUnknown};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key::{KeyStrategy, VERSION_SEPARATOR};
use crate::traits::{copy_blob_generic, BlobInfo, BlobStore, BlobStream};
use crate::write::{transfer, BlobWriteContext};

#[derive(Clone, Debug)]
struct MemoryEntry {
    data: Bytes,
    properties: BlobProperties,
}

/// In-memory, HashMap-based blob store.
///
/// Intended for tests, staging, and embedding. Each instance owns its map;
/// there is no process-wide registry. With versioning enabled every write
/// yields a fresh `key@<version>` and deduplication is not applied.
pub struct InMemoryBlobStore {
    name: String,
    key_strategy: KeyStrategy,
    versioning: bool,
    blobs: RwLock<HashMap<String, MemoryEntry>>,
}

impl InMemoryBlobStore {
    /// Create a new empty in-memory store.
    pub fn new(name: impl Into<String>, key_strategy: KeyStrategy) -> Self {
        Self {
            name: name.into(),
            key_strategy,
            versioning: false,
            blobs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a store that assigns a new version to every write.
    pub fn with_versioning(name: impl Into<String>, key_strategy: KeyStrategy) -> Self {
        Self {
            versioning: true,
            ..Self::new(name, key_strategy)
        }
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs
            .read()
            .expect("lock poisoned")
            .values()
            .map(|e| e.data.len() as u64)
            .sum()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.read().expect("lock poisoned").contains_key(key)
    }

    /// Sorted list of all keys.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Remove all blobs from the store.
    pub fn clear(&self) {
        self.blobs.write().expect("lock poisoned").clear();
    }

    fn insert(&self, key: &str, data: Bytes, keep_existing: bool) {
        let mut map = self.blobs.write().expect("lock poisoned");
        if keep_existing && map.contains_key(key) {
            return;
        }
        let properties = map.get(key).map(|e| e.properties.clone()).unwrap_or_default();
        map.insert(key.to_string(), MemoryEntry { data, properties });
    }
}

impl BlobStore for InMemoryBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    fn has_versioning(&self) -> bool {
        self.versioning
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String> {
        let mut data = Vec::new();
        transfer(ctx, &mut data)?;
        let key = ctx.storage_key()?;
        if self.versioning {
            if key.contains(VERSION_SEPARATOR) {
                return Err(StoreError::InvalidKey {
                    key,
                    reason: format!("contains the version separator {VERSION_SEPARATOR:?}"),
                });
            }
            let versioned = format!("{key}{VERSION_SEPARATOR}{}", rand::random::<u64>());
            debug!(store = %self.name, key = %versioned, len = data.len(), "wrote versioned blob");
            self.insert(&versioned, Bytes::from(data), false);
            return Ok(versioned);
        }
        let dedup = self.key_strategy.use_deduplication() && !ctx.has_storage_key();
        debug!(store = %self.name, key = %key, len = data.len(), "wrote blob");
        self.insert(&key, Bytes::from(data), dedup);
        Ok(key)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(match map.get(key) {
            Some(entry) => OptionalOrUnknown::Present(Box::new(Cursor::new(entry.data.clone()))),
            None => OptionalOrUnknown::Missing,
        })
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        let mut map = self.blobs.write().expect("lock poisoned");
        if let Some(entry) = map.get(key) {
            if entry.properties.is_retained(Utc::now()) {
                return Err(StoreError::UnderRetention(key.to_string()));
            }
            map.remove(key);
            debug!(store = %self.name, key, "deleted blob");
        }
        Ok(())
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        source.as_any().is::<InMemoryBlobStore>()
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        let Some(other) = source.as_any().downcast_ref::<InMemoryBlobStore>() else {
            return copy_blob_generic(self, key, source, source_key, atomic_move);
        };
        if self.versioning {
            return Err(StoreError::config(format!(
                "cannot copy blob {key} into store {} with versioning",
                self.name
            )));
        }
        let data = {
            let map = other.blobs.read().expect("lock poisoned");
            match map.get(source_key) {
                Some(entry) => entry.data.clone(),
                None => return Ok(false),
            }
        };
        self.insert(key, data, self.key_strategy.use_deduplication());
        if atomic_move {
            other.delete_blob(source_key)?;
        }
        Ok(true)
    }

    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()> {
        let mut map = self.blobs.write().expect("lock poisoned");
        let entry = map
            .get_mut(&update.key)
            .ok_or_else(|| StoreError::NotFound(update.key.clone()))?;
        entry.properties.apply(update);
        Ok(())
    }

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties> {
        let map = self.blobs.read().expect("lock poisoned");
        Ok(map.get(key).map(|e| e.properties.clone()).unwrap_or_default())
    }

    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        let map = self.blobs.read().expect("lock poisoned");
        let mut infos: Vec<BlobInfo> = map
            .iter()
            .map(|(key, entry)| BlobInfo {
                key: key.clone(),
                length: entry.data.len() as u64,
                properties: entry.properties.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for InMemoryBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobStore")
            .field("name", &self.name)
            .field("key_strategy", &self.key_strategy)
            .field("versioning", &self.versioning)
            .field("blob_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use strata_crypto::DigestAlgorithm;
    use strata_types::{BlobContext, ByteRange};

    fn store() -> InMemoryBlobStore {
        InMemoryBlobStore::new("mem", KeyStrategy::digest(DigestAlgorithm::Md5))
    }

    fn put(store: &InMemoryBlobStore, data: &[u8]) -> String {
        store.write(&BlobContext::new(data.to_vec())).unwrap()
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn write_and_read_back() {
        let store = store();
        let key = put(&store, b"hello world");
        assert_eq!(key, "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(store.read_bytes(&key).unwrap().unwrap(), b"hello world");
    }

    #[test]
    fn identical_content_deduplicates() {
        let store = store();
        let a = put(&store, b"identical content");
        let b = put(&store, b"identical content");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_key_is_missing_not_error() {
        let store = store();
        assert!(store.get_stream("nope").unwrap().is_missing());
        assert!(store.read_bytes("nope").unwrap().is_none());
        let dir = tempfile::tempdir().unwrap();
        assert!(!store.read_blob("nope", &dir.path().join("out")).unwrap());
    }

    #[test]
    fn get_file_is_unknown() {
        let store = store();
        let key = put(&store, b"x");
        assert!(store.get_file(&key).unwrap().is_unknown());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = store();
        let key = put(&store, b"to-delete");
        store.delete_blob(&key).unwrap();
        assert!(!store.contains(&key));
        store.delete_blob(&key).unwrap();
        store.delete_blob("never-written").unwrap();
    }

    #[test]
    fn read_blob_to_file() {
        let store = store();
        let key = put(&store, b"file bytes");
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        assert!(store.read_blob(&key, &dest).unwrap());
        assert_eq!(std::fs::read(dest).unwrap(), b"file bytes");
    }

    #[test]
    fn range_read() {
        let store = store();
        let key = put(&store, b"0123456789");
        let mut stream = store
            .get_stream_range(&key, ByteRange::new(2, 5).unwrap())
            .unwrap()
            .present()
            .unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"2345");
    }

    // -----------------------------------------------------------------------
    // Copy
    // -----------------------------------------------------------------------

    #[test]
    fn optimized_copy_between_memory_stores() {
        let src = store();
        let dst = store();
        let key = put(&src, b"copy me");
        assert!(dst.copy_blob_is_optimized(&src));
        assert!(dst.copy_blob(&key, &src, &key, false).unwrap());
        assert!(src.contains(&key));
        assert_eq!(dst.read_bytes(&key).unwrap().unwrap(), b"copy me");
    }

    #[test]
    fn move_removes_source() {
        let src = store();
        let dst = store();
        let key = put(&src, b"move me");
        assert!(dst.copy_blob(&key, &src, &key, true).unwrap());
        assert!(!src.contains(&key));
        assert!(dst.contains(&key));
    }

    #[test]
    fn copy_missing_source_returns_false() {
        let src = store();
        let dst = store();
        assert!(!dst.copy_blob("k", &src, "absent", true).unwrap());
        assert!(dst.is_empty());
    }

    // -----------------------------------------------------------------------
    // Versioning
    // -----------------------------------------------------------------------

    #[test]
    fn versioning_yields_distinct_keys() {
        let store = InMemoryBlobStore::with_versioning("v", KeyStrategy::DocId);
        let blob = BlobContext::new(b"v1".to_vec()).with_document("r", "doc1");
        let k1 = store.write(&blob).unwrap();
        let k2 = store.write(&blob).unwrap();
        assert!(k1.starts_with("doc1@"));
        assert!(k2.starts_with("doc1@"));
        assert_ne!(k1, k2);
        assert!(store.has_versioning());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn versioning_store_refuses_copy_in() {
        let src = store();
        let dst = InMemoryBlobStore::with_versioning("v", KeyStrategy::DocId);
        let key = put(&src, b"x");
        assert!(matches!(dst.copy_blob(&key, &src, &key, false), Err(StoreError::Config(_))));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    #[test]
    fn legal_hold_blocks_delete() {
        let store = store();
        let key = put(&store, b"held");
        store
            .write_blob_properties(&BlobUpdateContext::new(&key).with_legal_hold(true))
            .unwrap();
        assert!(store.blob_properties(&key).unwrap().legal_hold);
        assert!(matches!(store.delete_blob(&key), Err(StoreError::UnderRetention(_))));

        store
            .write_blob_properties(&BlobUpdateContext::new(&key).with_legal_hold(false))
            .unwrap();
        store.delete_blob(&key).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn properties_on_missing_blob_fail() {
        let store = store();
        let err = store
            .write_blob_properties(&BlobUpdateContext::new("absent").with_legal_hold(true))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_writes_of_same_content_converge() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(store());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || put(&store, b"shared data"))
            })
            .collect();
        let keys: Vec<String> = handles
            .into_iter()
            .map(|h| h.join().expect("thread should not panic"))
            .collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn debug_format() {
        let store = store();
        put(&store, b"x");
        let debug = format!("{store:?}");
        assert!(debug.contains("InMemoryBlobStore"));
        assert!(debug.contains("blob_count"));
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(32))]
        #[test]
        fn roundtrip_any_content(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 1..4096),
            a in 0usize..4096,
            b in 0usize..4096,
        ) {
            let store = store();
            let key = put(&store, &data);
            proptest::prop_assert_eq!(store.read_bytes(&key).unwrap().unwrap(), data.clone());

            let (start, end) = (a.min(b) % data.len(), a.max(b) % data.len());
            let (start, end) = (start.min(end), start.max(end));
            let range = ByteRange::new(start as u64, end as u64).unwrap();
            let mut slice = Vec::new();
            store
                .get_stream_range(&key, range)
                .unwrap()
                .present()
                .unwrap()
                .read_to_end(&mut slice)
                .unwrap();
            proptest::prop_assert_eq!(slice, data[start..=end].to_vec());
        }
    }
}

