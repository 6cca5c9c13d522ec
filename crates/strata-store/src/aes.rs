use std::any::Any;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use std::sync::Arc;

use strata_crypto::{crypto_error_from_io, DecryptingReader, EncryptingWriter, KeySource};
use strata_types::{BlobProperties, BlobUpdateContext, OptionalOrUnknown};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key::KeyStrategy;
use crate::traits::{copy_blob_generic, BlobInfo, BlobStore, BlobStream};
use crate::write::{transfer, BlobWriteContext};

/// Decorator encrypting blobs on write and decrypting them on read.
///
/// Keys are derived from the plaintext, so deduplication behaves exactly as
/// on the inner store. The inner store only ever sees envelopes. `get_file`
/// always answers `Unknown`: the inner files hold ciphertext.
pub struct AesBlobStore {
    name: String,
    inner: Arc<dyn BlobStore>,
    key_source: KeySource,
    key_strategy: KeyStrategy,
}

impl AesBlobStore {
    pub fn new(
        name: impl Into<String>,
        inner: Arc<dyn BlobStore>,
        key_source: KeySource,
        key_strategy: KeyStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            inner,
            key_source,
            key_strategy,
        }
    }

    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.inner
    }

    /// Open the raw envelope held by the inner store.
    fn raw_stream(&self, key: &str) -> StoreResult<Option<BlobStream>> {
        match self.inner.get_stream(key)? {
            OptionalOrUnknown::Present(stream) => Ok(Some(stream)),
            OptionalOrUnknown::Missing => Ok(None),
            OptionalOrUnknown::Unknown => match self.inner.get_file(key)? {
                OptionalOrUnknown::Present(path) => Ok(Some(Box::new(File::open(path)?))),
                OptionalOrUnknown::Missing => Ok(None),
                OptionalOrUnknown::Unknown => {
                    let tmp = tempfile::NamedTempFile::new()?;
                    if !self.inner.read_blob(key, tmp.path())? {
                        return Ok(None);
                    }
                    Ok(Some(Box::new(Cursor::new(std::fs::read(tmp.path())?))))
                }
            },
        }
    }

    fn decrypt_into<W: Write + ?Sized>(&self, raw: BlobStream, out: &mut W) -> StoreResult<u64> {
        let mut reader = DecryptingReader::new(raw, &self.key_source)?;
        io::copy(&mut reader, out).map_err(|e| StoreError::Crypto(crypto_error_from_io(e)))
    }
}

impl BlobStore for AesBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    fn has_versioning(&self) -> bool {
        self.inner.has_versioning()
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String> {
        let tmp = tempfile::NamedTempFile::new()?;
        let mut writer = EncryptingWriter::new(tmp.reopen()?, &self.key_source)?;
        let len = transfer(ctx, &mut writer)?;
        writer.finish()?;

        let key = ctx.storage_key()?;
        let mut encrypted = BlobWriteContext::from_file(key.as_str(), tmp.path())?;
        let written = self.inner.write_blob(&mut encrypted)?;
        debug!(store = %self.name, key = %written, len, "wrote encrypted blob");
        Ok(written)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        let Some(raw) = self.raw_stream(key)? else {
            return Ok(OptionalOrUnknown::Missing);
        };
        let reader = DecryptingReader::new(raw, &self.key_source)?;
        Ok(OptionalOrUnknown::Present(Box::new(reader)))
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let Some(raw) = self.raw_stream(key)? else {
            return Ok(false);
        };
        let mut out = File::create(dest)?;
        self.decrypt_into(raw, &mut out)?;
        Ok(true)
    }

    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(raw) = self.raw_stream(key)? else {
            return Ok(None);
        };
        let mut data = Vec::new();
        self.decrypt_into(raw, &mut data)?;
        Ok(Some(data))
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        self.inner.delete_blob(key)
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        copy_blob_generic(self, key, source, source_key, atomic_move)
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

impl std::fmt::Debug for AesBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesBlobStore")
            .field("name", &self.name)
            .field("inner", &self.inner.name())
            .field("key_source", &self.key_source)
            .field("key_strategy", &self.key_strategy)
            .finish()
    }
}
