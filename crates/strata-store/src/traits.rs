use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use strata_types::{BlobContext, BlobProperties, BlobUpdateContext, ByteRange, OptionalOrUnknown};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key::KeyStrategy;
use crate::write::BlobWriteContext;

/// A readable blob stream.
pub type BlobStream = Box<dyn Read + Send>;

/// One stored blob, as seen by a garbage collection scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    pub key: String,
    /// Stored length in bytes (ciphertext length for encrypted stores).
    pub length: u64,
    pub properties: BlobProperties,
}

/// Durable key → bytes storage.
///
/// All implementations must satisfy these invariants:
/// - A write pulls its source exactly once; the key is resolved after the
///   last byte and only then exposed.
/// - Absence is not an error: reads and copies report it as `Missing` or
///   `false`.
/// - `Unknown` means "ask another way", never "does not exist".
/// - Deleting an absent key is a no-op.
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Store name, for logs and diagnostics.
    fn name(&self) -> &str;

    fn key_strategy(&self) -> &KeyStrategy;

    /// Whether every write yields a new, permanently distinct versioned key.
    fn has_versioning(&self) -> bool {
        false
    }

    /// Transfer the write source to storage and return the key written.
    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String>;

    /// Convenience: derive a write context with this store's key strategy and
    /// write it.
    fn write(&self, blob: &BlobContext) -> StoreResult<String> {
        let mut ctx = self.key_strategy().blob_write_context(blob)?;
        self.write_blob(&mut ctx)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>>;

    /// Local file holding the blob, for stores that keep plain files.
    fn get_file(&self, _key: &str) -> StoreResult<OptionalOrUnknown<PathBuf>> {
        Ok(OptionalOrUnknown::Unknown)
    }

    /// Stream over `range` of the blob. Ranges past the end are truncated.
    fn get_stream_range(&self, key: &str, range: ByteRange) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        Ok(self.get_stream(key)?.map(|stream| slice_stream(stream, range)))
    }

    /// Copy the blob to `dest`. Returns `false` if the key is absent.
    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        match self.get_stream(key)? {
            OptionalOrUnknown::Present(mut stream) => {
                let mut out = File::create(dest)?;
                io::copy(&mut stream, &mut out)?;
                Ok(true)
            }
            OptionalOrUnknown::Missing => Ok(false),
            OptionalOrUnknown::Unknown => match self.get_file(key)? {
                OptionalOrUnknown::Present(path) => {
                    std::fs::copy(path, dest)?;
                    Ok(true)
                }
                OptionalOrUnknown::Missing => Ok(false),
                OptionalOrUnknown::Unknown => Err(StoreError::config(format!(
                    "store {} can neither stream nor expose files",
                    self.name()
                ))),
            },
        }
    }

    /// Read the whole blob into memory.
    fn read_bytes(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.get_stream(key)? {
            OptionalOrUnknown::Present(mut stream) => {
                let mut data = Vec::new();
                stream.read_to_end(&mut data)?;
                Ok(Some(data))
            }
            OptionalOrUnknown::Missing => Ok(None),
            OptionalOrUnknown::Unknown => {
                let tmp = tempfile::NamedTempFile::new()?;
                if self.read_blob(key, tmp.path())? {
                    Ok(Some(std::fs::read(tmp.path())?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Delete the blob. Absent keys are ignored.
    fn delete_blob(&self, key: &str) -> StoreResult<()>;

    /// Whether [`copy_blob`](Self::copy_blob) from `source` avoids a byte
    /// round-trip.
    fn copy_blob_is_optimized(&self, _source: &dyn BlobStore) -> bool {
        false
    }

    /// Copy (or move, with `atomic_move`) `source_key` of `source` into this
    /// store under `key`. Returns `false` if the source blob is absent.
    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool>;

    /// Apply a metadata-only update to an existing blob.
    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()>;

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties>;

    /// Every stored blob; input to garbage collection.
    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>>;

    fn as_any(&self) -> &dyn Any;
}

/// Restrict a stream to `range`.
pub fn slice_stream(mut stream: BlobStream, range: ByteRange) -> BlobStream {
    let skipped = io::copy(&mut (&mut stream).take(range.start()), &mut io::sink());
    match skipped {
        Ok(_) => Box::new(stream.take(range.length())),
        Err(e) => Box::new(FailedStream(Some(e))),
    }
}

struct FailedStream(Option<io::Error>);

impl Read for FailedStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        match self.0.take() {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }
}

/// Copy through the cheapest access path the source offers: stream, then
/// local file, then a temporary file filled by `read_blob`.
pub fn copy_blob_generic(
    dest: &dyn BlobStore,
    key: &str,
    source: &dyn BlobStore,
    source_key: &str,
    atomic_move: bool,
) -> StoreResult<bool> {
    let found = match source.get_stream(source_key)? {
        OptionalOrUnknown::Present(stream) => {
            write_copy(dest, key, BlobWriteContext::from_reader(key, stream))?;
            true
        }
        OptionalOrUnknown::Missing => false,
        OptionalOrUnknown::Unknown => match source.get_file(source_key)? {
            OptionalOrUnknown::Present(path) => {
                write_copy(dest, key, BlobWriteContext::from_file(key, &path)?)?;
                true
            }
            OptionalOrUnknown::Missing => false,
            OptionalOrUnknown::Unknown => {
                let tmp = tempfile::NamedTempFile::new()?;
                if source.read_blob(source_key, tmp.path())? {
                    write_copy(dest, key, BlobWriteContext::from_file(key, tmp.path())?)?;
                    true
                } else {
                    false
                }
            }
        },
    };
    if !found {
        debug!(source = source.name(), source_key, "copy source missing");
        return Ok(false);
    }
    if atomic_move {
        source.delete_blob(source_key)?;
    }
    Ok(true)
}

fn write_copy(dest: &dyn BlobStore, key: &str, mut ctx: BlobWriteContext<'_>) -> StoreResult<()> {
    let written = dest.write_blob(&mut ctx)?;
    if written != key {
        // A versioning store assigned a new key; the copy would be unreachable.
        dest.delete_blob(&written)?;
        return Err(StoreError::config(format!(
            "cannot copy blob {key} into store {} with versioning",
            dest.name()
        )));
    }
    Ok(())
}
