use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::BlobStore;

/// Counters reported by a sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcStatus {
    /// Blobs kept: marked, or protected by legal hold/retention.
    pub num_binaries: u64,
    pub size_binaries: u64,
    /// Blobs unmarked and removed (or that would be, in a dry run).
    pub num_binaries_gc: u64,
    pub size_binaries_gc: u64,
}

/// Mark-and-sweep collector over one store.
///
/// ```text
/// start() -> mark(key)* -> remove_unmarked_blobs_and_update_status(delete)
/// ```
///
/// With a deduplicating key strategy, stored keys that are not valid digests
/// are not blobs of this store and are neither counted nor deleted.
pub struct GarbageCollector<'s> {
    store: &'s dyn BlobStore,
    marked: HashSet<String>,
    in_progress: bool,
    status: GcStatus,
}

impl<'s> GarbageCollector<'s> {
    pub fn new(store: &'s dyn BlobStore) -> Self {
        Self {
            store,
            marked: HashSet::new(),
            in_progress: false,
            status: GcStatus::default(),
        }
    }

    pub fn start(&mut self) -> StoreResult<()> {
        if self.in_progress {
            return Err(StoreError::config(format!(
                "garbage collection already in progress on store {}",
                self.store.name()
            )));
        }
        self.marked.clear();
        self.status = GcStatus::default();
        self.in_progress = true;
        debug!(store = self.store.name(), "gc started");
        Ok(())
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Record `key` as live.
    pub fn mark(&mut self, key: impl Into<String>) {
        self.marked.insert(key.into());
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    /// Status of the last completed sweep.
    pub fn status(&self) -> GcStatus {
        self.status
    }

    /// Sweep every unmarked blob. Only physically deletes when `delete` is
    /// set; a dry run reports the same counters and leaves the store as is.
    pub fn remove_unmarked_blobs_and_update_status(&mut self, delete: bool) -> StoreResult<GcStatus> {
        if !self.in_progress {
            return Err(StoreError::config("garbage collection not started"));
        }
        let strategy = self.store.key_strategy();
        let dedup = strategy.use_deduplication();
        let now = Utc::now();
        let mut status = GcStatus::default();

        for blob in self.store.list_blobs()? {
            if dedup && strategy.digest_from_key(&blob.key).is_none() {
                continue;
            }
            let live = self.marked.contains(&blob.key) || blob.properties.is_retained(now);
            if live {
                status.num_binaries += 1;
                status.size_binaries += blob.length;
                continue;
            }
            if delete {
                if let Err(e) = self.store.delete_blob(&blob.key) {
                    warn!(store = self.store.name(), key = %blob.key, error = %e, "gc failed to delete blob");
                    status.num_binaries += 1;
                    status.size_binaries += blob.length;
                    continue;
                }
            }
            status.num_binaries_gc += 1;
            status.size_binaries_gc += blob.length;
        }

        info!(
            store = self.store.name(),
            delete,
            kept = status.num_binaries,
            kept_bytes = status.size_binaries,
            removed = status.num_binaries_gc,
            removed_bytes = status.size_binaries_gc,
            "gc finished"
        );
        self.status = status;
        self.in_progress = false;
        self.marked.clear();
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::KeyStrategy;
    use crate::local::LocalBlobStore;
    use crate::memory::InMemoryBlobStore;
    use std::io::Cursor;
    use strata_crypto::DigestAlgorithm;
    use strata_types::{BlobContext, BlobUpdateContext};

    fn md5() -> KeyStrategy {
        KeyStrategy::digest(DigestAlgorithm::Md5)
    }

    fn filled() -> (InMemoryBlobStore, Vec<String>) {
        let store = InMemoryBlobStore::new("mem", md5());
        let keys = [&b"alpha"[..], b"beta", b"gamma!"]
            .iter()
            .map(|data| store.write(&BlobContext::new(data.to_vec())).unwrap())
            .collect();
        (store, keys)
    }

    fn snapshot(store: &InMemoryBlobStore) -> Vec<(String, Vec<u8>)> {
        store
            .keys()
            .into_iter()
            .map(|k| {
                let data = store.read_bytes(&k).unwrap().unwrap();
                (k, data)
            })
            .collect()
    }

    #[test]
    fn dry_run_leaves_store_unchanged() {
        let (store, keys) = filled();
        let before = snapshot(&store);

        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        gc.mark(keys[0].clone());
        let status = gc.remove_unmarked_blobs_and_update_status(false).unwrap();

        assert_eq!(snapshot(&store), before);
        assert_eq!(
            status,
            GcStatus {
                num_binaries: 1,
                size_binaries: 5,
                num_binaries_gc: 2,
                size_binaries_gc: 10,
            }
        );
        assert!(!gc.is_in_progress());
    }

    #[test]
    fn delete_removes_only_unmarked() {
        let (store, keys) = filled();
        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        gc.mark(keys[1].clone());
        let status = gc.remove_unmarked_blobs_and_update_status(true).unwrap();
        assert_eq!(status.num_binaries, 1);
        assert_eq!(status.num_binaries_gc, 2);
        assert_eq!(store.keys(), vec![keys[1].clone()]);
        assert_eq!(gc.status(), status);
    }

    #[test]
    fn legal_hold_survives_sweep() {
        let (store, keys) = filled();
        store
            .write_blob_properties(&BlobUpdateContext::new(&keys[2]).with_legal_hold(true))
            .unwrap();
        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        let status = gc.remove_unmarked_blobs_and_update_status(true).unwrap();
        assert_eq!(status.num_binaries, 1);
        assert_eq!(status.size_binaries, 6);
        assert_eq!(store.keys(), vec![keys[2].clone()]);
    }

    #[test]
    fn non_digest_keys_are_ignored() {
        let (store, _) = filled();
        let mut ctx = crate::write::BlobWriteContext::from_reader("stray", Box::new(Cursor::new(b"x".to_vec())));
        store.write_blob(&mut ctx).unwrap();

        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        let status = gc.remove_unmarked_blobs_and_update_status(true).unwrap();
        assert_eq!(status.num_binaries_gc, 3);
        assert_eq!(store.keys(), vec!["stray".to_string()]);
    }

    #[test]
    fn doc_id_store_sweeps_every_key() {
        let store = InMemoryBlobStore::new("docs", KeyStrategy::DocId);
        store
            .write(&BlobContext::new(b"a".to_vec()).with_document("r", "doc1"))
            .unwrap();
        store
            .write(&BlobContext::new(b"b".to_vec()).with_document("r", "doc2"))
            .unwrap();
        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        gc.mark("doc2");
        let status = gc.remove_unmarked_blobs_and_update_status(true).unwrap();
        assert_eq!(status.num_binaries_gc, 1);
        assert_eq!(store.keys(), vec!["doc2".to_string()]);
    }

    #[test]
    fn sweep_requires_start() {
        let (store, _) = filled();
        let mut gc = GarbageCollector::new(&store);
        assert!(gc.remove_unmarked_blobs_and_update_status(false).is_err());
        gc.start().unwrap();
        assert!(gc.is_in_progress());
        assert!(gc.start().is_err());
    }

    #[test]
    fn local_store_dry_run_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::open("local", dir.path(), md5()).unwrap();
        let live = store.write(&BlobContext::new(b"live".to_vec())).unwrap();
        let dead = store.write(&BlobContext::new(b"dead".to_vec())).unwrap();

        let mut gc = GarbageCollector::new(&store);
        gc.start().unwrap();
        gc.mark(live.clone());
        let status = gc.remove_unmarked_blobs_and_update_status(false).unwrap();
        assert_eq!(status.num_binaries_gc, 1);
        assert_eq!(store.read_bytes(&dead).unwrap().unwrap(), b"dead");

        gc.start().unwrap();
        gc.mark(live.clone());
        gc.remove_unmarked_blobs_and_update_status(true).unwrap();
        assert!(store.get_stream(&dead).unwrap().is_missing());
        assert!(store.get_stream(&live).unwrap().is_present());
    }
}
