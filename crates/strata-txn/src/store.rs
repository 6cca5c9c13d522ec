use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use strata_store::{BlobInfo, BlobStore, BlobStream, BlobWriteContext, KeyStrategy, StoreError, StoreResult};
use strata_types::{BlobProperties, BlobUpdateContext, ByteRange, OptionalOrUnknown};
use tracing::{debug, error, warn};

use crate::transaction::{Synchronization, Transaction, TransactionId, TransactionStatus};
use crate::view::TransactionalView;

/// Where the uncommitted state of one key lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum TransientKey {
    /// New bytes, under this key of the staging store.
    Staged(String),
    /// The key is deleted on commit.
    Deleted,
}

/// Uncommitted state of one key in one transaction.
#[derive(Clone, Debug, Default)]
pub(crate) struct TransientInfo {
    pub(crate) transient: Option<TransientKey>,
    pub(crate) update: Option<BlobUpdateContext>,
}

/// Where a read inside a transaction must go.
pub(crate) enum ReadTarget {
    Missing,
    Staging(String),
    Permanent,
}

pub(crate) struct Shared {
    pub(crate) permanent: Arc<dyn BlobStore>,
    /// `None` when the permanent store versions every write and stages in place.
    pub(crate) staging: Option<Arc<dyn BlobStore>>,
    claims: Mutex<HashMap<String, TransactionId>>,
    transactions: Mutex<HashMap<TransactionId, HashMap<String, TransientInfo>>>,
}

/// Makes writes and deletes atomic with respect to a [`Transaction`].
///
/// Inside a transaction (through [`bind`](Self::bind)) new bytes go to a
/// staging area and deletes are recorded as markers; nothing reaches the
/// permanent store until the transaction commits. A key can be held by one
/// open transaction at a time: a second transaction touching it fails with
/// [`StoreError::ConcurrentUpdate`].
///
/// Used directly, the store is a non-transactional pass-through to the
/// permanent store.
pub struct TransactionalBlobStore {
    shared: Arc<Shared>,
}

impl TransactionalBlobStore {
    /// Stage into a separate `staging` store, moving blobs into `permanent`
    /// on commit.
    pub fn with_staging(permanent: Arc<dyn BlobStore>, staging: Arc<dyn BlobStore>) -> StoreResult<Self> {
        if permanent.has_versioning() {
            return Err(StoreError::Config(format!(
                "store {} has versioning and must stage in place, not in {}",
                permanent.name(),
                staging.name()
            )));
        }
        if staging.has_versioning() {
            return Err(StoreError::Config(format!(
                "staging store {} must not have versioning",
                staging.name()
            )));
        }
        Ok(Self::from_parts(permanent, Some(staging)))
    }

    /// Stage in place: every write to a versioning store already gets a
    /// new, permanently distinct key, so commit has no bytes to move.
    pub fn versioned(store: Arc<dyn BlobStore>) -> StoreResult<Self> {
        if !store.has_versioning() {
            return Err(StoreError::Config(format!(
                "store {} has no versioning and needs a separate staging store",
                store.name()
            )));
        }
        Ok(Self::from_parts(store, None))
    }

    fn from_parts(permanent: Arc<dyn BlobStore>, staging: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                permanent,
                staging,
                claims: Mutex::new(HashMap::new()),
                transactions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Transactional view of this store for `tx`.
    pub fn bind(&self, tx: &Transaction) -> TransactionalView {
        TransactionalView::new(tx.handle(), Arc::clone(&self.shared))
    }

    pub fn permanent(&self) -> &Arc<dyn BlobStore> {
        &self.shared.permanent
    }

    /// The separate staging store, if any.
    pub fn staging(&self) -> Option<&Arc<dyn BlobStore>> {
        self.shared.staging.as_ref()
    }

    /// Keys with uncommitted state in `tx`, sorted.
    pub fn pending_keys(&self, tx: TransactionId) -> Vec<String> {
        let transactions = self.shared.transactions.lock().expect("lock poisoned");
        let mut keys: Vec<String> = transactions
            .get(&tx)
            .map(|infos| infos.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Keys currently held by an open transaction, sorted.
    pub fn claimed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shared
            .claims
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

impl Shared {
    /// The store holding staged bytes.
    pub(crate) fn staging_store(&self) -> &dyn BlobStore {
        match &self.staging {
            Some(staging) => staging.as_ref(),
            None => self.permanent.as_ref(),
        }
    }

    pub(crate) fn stages_in_place(&self) -> bool {
        self.staging.is_none()
    }

    /// Claim `key` for `tx`. Succeeds if it is free or already held by `tx`.
    pub(crate) fn claim(&self, key: &str, tx: TransactionId) -> StoreResult<()> {
        let mut claims = self.claims.lock().expect("lock poisoned");
        match claims.get(key) {
            Some(owner) if *owner != tx => {
                debug!(key, tx = %tx, owner = %owner, "claim conflict");
                Err(StoreError::ConcurrentUpdate { key: key.to_string() })
            }
            Some(_) => Ok(()),
            None => {
                claims.insert(key.to_string(), tx);
                Ok(())
            }
        }
    }

    /// Delete an orphaned staged object. Failures are logged only.
    pub(crate) fn discard_staged(&self, staged: &str) {
        if let Err(e) = self.staging_store().delete_blob(staged) {
            warn!(staged, error = %e, "failed to delete staged blob");
        }
    }

    /// Apply `change` to the transient info of `key` in `tx`. Returns `true`
    /// when this is the first key `tx` touches, so the caller registers the
    /// completion hook.
    pub(crate) fn record<F>(&self, tx: TransactionId, key: &str, change: F) -> bool
    where
        F: FnOnce(&mut TransientInfo),
    {
        let (first, superseded) = {
            let mut transactions = self.transactions.lock().expect("lock poisoned");
            let first = !transactions.contains_key(&tx);
            let info = transactions
                .entry(tx)
                .or_default()
                .entry(key.to_string())
                .or_default();
            let before = info.transient.clone();
            change(info);
            let superseded = match (before, &info.transient) {
                (Some(TransientKey::Staged(old)), Some(TransientKey::Staged(new))) if old == *new => None,
                (Some(TransientKey::Staged(old)), _) => Some(old),
                _ => None,
            };
            (first, superseded)
        };
        if let Some(old) = superseded {
            debug!(key, staged = %old, "superseded staged blob");
            self.discard_staged(&old);
        }
        first
    }

    pub(crate) fn transient(&self, tx: TransactionId, key: &str) -> Option<TransientInfo> {
        let transactions = self.transactions.lock().expect("lock poisoned");
        transactions.get(&tx).and_then(|infos| infos.get(key)).cloned()
    }

    pub(crate) fn read_target(&self, tx: TransactionId, key: &str) -> ReadTarget {
        match self.transient(tx, key).and_then(|info| info.transient) {
            Some(TransientKey::Deleted) => ReadTarget::Missing,
            Some(TransientKey::Staged(staged)) => ReadTarget::Staging(staged),
            None => ReadTarget::Permanent,
        }
    }

    fn complete(&self, tx: TransactionId, status: TransactionStatus) {
        let infos = self
            .transactions
            .lock()
            .expect("lock poisoned")
            .remove(&tx)
            .unwrap_or_default();
        let mut keys: Vec<&String> = infos.keys().collect();
        keys.sort();
        match status {
            TransactionStatus::Committed => {
                for key in &keys {
                    self.commit_key(key, &infos[*key]);
                }
            }
            _ => {
                for key in &keys {
                    if let Some(TransientKey::Staged(staged)) = &infos[*key].transient {
                        self.discard_staged(staged);
                    }
                }
            }
        }
        let mut claims = self.claims.lock().expect("lock poisoned");
        claims.retain(|_, owner| *owner != tx);
        debug!(tx = %tx, status = ?status, keys = keys.len(), "transactional blobs completed");
    }

    /// Best effort: a failing key is logged and skipped, the others still commit.
    fn commit_key(&self, key: &str, info: &TransientInfo) {
        match &info.transient {
            Some(TransientKey::Deleted) => {
                if let Err(e) = self.permanent.delete_blob(key) {
                    error!(key, error = %e, "commit: failed to delete blob, skipping");
                    return;
                }
            }
            Some(TransientKey::Staged(staged)) => {
                if let Some(staging) = &self.staging {
                    // Only a native move is atomic; otherwise copy, then clean up.
                    let atomic_move = self.permanent.copy_blob_is_optimized(staging.as_ref());
                    match self.permanent.copy_blob(key, staging.as_ref(), staged, atomic_move) {
                        Ok(true) => {}
                        Ok(false) => {
                            error!(key, staged = %staged, "commit: staged blob vanished, skipping");
                            return;
                        }
                        Err(e) => {
                            error!(key, staged = %staged, error = %e, "commit: failed to move staged blob, skipping");
                            return;
                        }
                    }
                    if !atomic_move {
                        self.discard_staged(staged);
                    }
                }
            }
            None => {}
        }
        if let Some(update) = &info.update {
            if let Err(e) = self.permanent.write_blob_properties(update) {
                error!(key, error = %e, "commit: failed to apply blob properties, skipping");
            }
        }
    }
}

/// Registered with a transaction on its first touched key.
pub(crate) struct CompletionHook {
    pub(crate) shared: Arc<Shared>,
}

impl Synchronization for CompletionHook {
    fn after_completion(&self, tx: TransactionId, status: TransactionStatus) {
        self.shared.complete(tx, status);
    }
}

// Outside a transaction every call goes straight to the permanent store.
impl BlobStore for TransactionalBlobStore {
    fn name(&self) -> &str {
        self.shared.permanent.name()
    }

    fn key_strategy(&self) -> &KeyStrategy {
        self.shared.permanent.key_strategy()
    }

    fn has_versioning(&self) -> bool {
        self.shared.permanent.has_versioning()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String> {
        self.shared.permanent.write_blob(ctx)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        self.shared.permanent.get_stream(key)
    }

    fn get_file(&self, key: &str) -> StoreResult<OptionalOrUnknown<PathBuf>> {
        self.shared.permanent.get_file(key)
    }

    fn get_stream_range(&self, key: &str, range: ByteRange) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        self.shared.permanent.get_stream_range(key, range)
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        self.shared.permanent.read_blob(key, dest)
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.shared.permanent.delete_blob(key)
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        self.shared.permanent.copy_blob_is_optimized(source)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        self.shared.permanent.copy_blob(key, source, source_key, atomic_move)
    }

    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()> {
        self.shared.permanent.write_blob_properties(update)
    }

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties> {
        self.shared.permanent.blob_properties(key)
    }

    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        self.shared.permanent.list_blobs()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for TransactionalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalBlobStore")
            .field("permanent", &self.shared.permanent.name())
            .field("staging", &self.shared.staging.as_ref().map(|s| s.name().to_string()))
            .field("claimed", &self.claimed_keys().len())
            .finish()
    }
}
