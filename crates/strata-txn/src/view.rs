use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_store::{BlobInfo, BlobStore, BlobStream, BlobWriteContext, KeyStrategy, StoreError, StoreResult};
use strata_types::{BlobProperties, BlobUpdateContext, ByteRange, OptionalOrUnknown};
use tracing::debug;
use uuid::Uuid;

use crate::store::{CompletionHook, ReadTarget, Shared, TransientInfo, TransientKey};
use crate::transaction::{TransactionHandle, TransactionId};

/// A [`TransactionalBlobStore`](crate::TransactionalBlobStore) seen from
/// inside one transaction.
///
/// Writes, deletes, and property updates are staged; reads see this
/// transaction's own staged state first and the permanent store otherwise.
/// Once the transaction has completed, staging through the view fails and
/// reads see the permanent store.
pub struct TransactionalView {
    tx: TransactionHandle,
    shared: Arc<Shared>,
}

impl TransactionalView {
    pub(crate) fn new(tx: TransactionHandle, shared: Arc<Shared>) -> Self {
        Self { tx, shared }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tx.id()
    }

    /// Early check before staging bytes; [`claim_and_record`](Self::claim_and_record)
    /// re-checks under the lock.
    fn ensure_open(&self) -> StoreResult<()> {
        if self.tx.status().is_open() {
            Ok(())
        } else {
            Err(completed(self.tx.id()))
        }
    }

    /// Claim `key` and apply `change` to its transient info. Both happen
    /// under the transaction's state lock, so completion either sees the
    /// change (and its hook) or the call fails with nothing recorded.
    fn claim_and_record<F>(&self, key: &str, change: F) -> StoreResult<()>
    where
        F: FnOnce(&mut TransientInfo),
    {
        let id = self.tx.id();
        self.tx
            .while_open(|synchronizations| -> StoreResult<()> {
                self.shared.claim(key, id)?;
                if self.shared.record(id, key, change) {
                    synchronizations.push(Arc::new(CompletionHook {
                        shared: Arc::clone(&self.shared),
                    }));
                }
                Ok(())
            })
            .unwrap_or_else(|| Err(completed(id)))
    }

    /// Record `staged` as the new bytes of `key`. On failure the staged
    /// object is deleted.
    pub(crate) fn stage(&self, key: String, staged: String) -> StoreResult<String> {
        let target = staged.clone();
        if let Err(e) = self.claim_and_record(&key, move |info| info.transient = Some(TransientKey::Staged(target))) {
            self.shared.discard_staged(&staged);
            return Err(e);
        }
        debug!(tx = %self.tx.id(), key = %key, staged = %staged, "staged blob");
        Ok(key)
    }
}

impl BlobStore for TransactionalView {
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
        self.ensure_open()?;
        if self.shared.stages_in_place() {
            // The versioned key is final and known to nobody else yet.
            let key = self.shared.permanent.write_blob(ctx)?;
            return self.stage(key.clone(), key);
        }
        // A unique staging key keeps concurrent staged writes apart even
        // when they resolve to the same logical key.
        ctx.set_storage_key(Uuid::now_v7().simple().to_string());
        let staged = self.shared.staging_store().write_blob(ctx)?;
        let key = ctx.key()?;
        self.stage(key, staged)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        match self.shared.read_target(self.tx.id(), key) {
            ReadTarget::Missing => Ok(OptionalOrUnknown::Missing),
            ReadTarget::Staging(staged) => self.shared.staging_store().get_stream(&staged),
            ReadTarget::Permanent => self.shared.permanent.get_stream(key),
        }
    }

    fn get_file(&self, key: &str) -> StoreResult<OptionalOrUnknown<PathBuf>> {
        match self.shared.read_target(self.tx.id(), key) {
            ReadTarget::Missing => Ok(OptionalOrUnknown::Missing),
            ReadTarget::Staging(staged) => self.shared.staging_store().get_file(&staged),
            ReadTarget::Permanent => self.shared.permanent.get_file(key),
        }
    }

    fn get_stream_range(&self, key: &str, range: ByteRange) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        match self.shared.read_target(self.tx.id(), key) {
            ReadTarget::Missing => Ok(OptionalOrUnknown::Missing),
            ReadTarget::Staging(staged) => self.shared.staging_store().get_stream_range(&staged, range),
            ReadTarget::Permanent => self.shared.permanent.get_stream_range(key, range),
        }
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        match self.shared.read_target(self.tx.id(), key) {
            ReadTarget::Missing => Ok(false),
            ReadTarget::Staging(staged) => self.shared.staging_store().read_blob(&staged, dest),
            ReadTarget::Permanent => self.shared.permanent.read_blob(key, dest),
        }
    }

    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.shared.read_target(self.tx.id(), key) {
            ReadTarget::Missing => Ok(None),
            ReadTarget::Staging(staged) => self.shared.staging_store().read_bytes(&staged),
            ReadTarget::Permanent => self.shared.permanent.read_bytes(key),
        }
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.ensure_open()?;
        self.claim_and_record(key, |info| info.transient = Some(TransientKey::Deleted))?;
        debug!(tx = %self.tx.id(), key, "staged delete");
        Ok(())
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        self.ensure_open()?;
        let staging = self.shared.staging_store();
        if self.shared.stages_in_place() {
            // copying into a versioning store is refused by the store itself
            return staging.copy_blob(key, source, source_key, atomic_move);
        }
        let staged = Uuid::now_v7().simple().to_string();
        if !staging.copy_blob(&staged, source, source_key, false)? {
            return Ok(false);
        }
        self.stage(key.to_string(), staged)?;
        if atomic_move {
            source.delete_blob(source_key)?;
        }
        Ok(true)
    }

    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()> {
        self.ensure_open()?;
        let update = update.clone();
        let key = update.key.clone();
        self.claim_and_record(&key, move |info| {
            info.update = Some(match info.update.take() {
                Some(mut pending) => {
                    pending.merge(update);
                    pending
                }
                None => update,
            });
        })
    }

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties> {
        let transient = self.shared.transient(self.tx.id(), key);
        let mut properties = match transient.as_ref().and_then(|t| t.transient.as_ref()) {
            Some(TransientKey::Deleted) => BlobProperties::default(),
            Some(TransientKey::Staged(staged)) => self.shared.staging_store().blob_properties(staged)?,
            None => self.shared.permanent.blob_properties(key)?,
        };
        if let Some(update) = transient.as_ref().and_then(|t| t.update.as_ref()) {
            properties.apply(update);
        }
        Ok(properties)
    }

    /// Committed blobs only.
    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        self.shared.permanent.list_blobs()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn completed(tx: TransactionId) -> StoreError {
    StoreError::Config(format!("transaction {tx} has completed"))
}

impl std::fmt::Debug for TransactionalView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionalView")
            .field("tx", &self.tx.id())
            .field("permanent", &self.shared.permanent.name())
            .finish()
    }
}
