use std::any::Any;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::Utc;
use strata_types::{BlobProperties, BlobUpdateContext, ByteRange, OptionalOrUnknown};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::key::KeyStrategy;
use crate::path::PathStrategy;
use crate::traits::{copy_blob_generic, BlobInfo, BlobStore, BlobStream};
use crate::write::{transfer, BlobWriteContext};

/// Suffix of the JSON sidecar holding a blob's properties.
const PROPS_SUFFIX: &str = ".props";

/// Blob store keeping one file per blob under a root directory.
///
/// Layout:
/// ```text
/// <root>/data/...   blobs, placed by the path strategy
/// <root>/tmp/       in-flight writes, renamed into data/ when complete
/// ```
pub struct LocalBlobStore {
    name: String,
    root: PathBuf,
    tmp_dir: PathBuf,
    key_strategy: KeyStrategy,
    path_strategy: PathStrategy,
}

impl LocalBlobStore {
    /// Open (or create) a store with the default two-level sub-directory layout.
    pub fn open(name: impl Into<String>, root: &Path, key_strategy: KeyStrategy) -> StoreResult<Self> {
        let paths = PathStrategy::subdirs(root.join("data"), 2)?;
        Self::with_path_strategy(name, root, key_strategy, paths)
    }

    /// Open (or create) a store with an explicit path strategy. The strategy's
    /// directory holds the blobs; temp files go to `<root>/tmp`.
    pub fn with_path_strategy(
        name: impl Into<String>,
        root: &Path,
        key_strategy: KeyStrategy,
        path_strategy: PathStrategy,
    ) -> StoreResult<Self> {
        let tmp_dir = root.join("tmp");
        fs::create_dir_all(path_strategy.dir())?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            name: name.into(),
            root: root.to_path_buf(),
            tmp_dir,
            key_strategy,
            path_strategy,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_strategy(&self) -> &PathStrategy {
        &self.path_strategy
    }

    /// Create an empty temp file on the same filesystem as the blobs, so it can
    /// be renamed into place atomically.
    pub fn create_temp_file(&self) -> StoreResult<NamedTempFile> {
        Ok(tempfile::Builder::new()
            .prefix("bin_")
            .suffix(".tmp")
            .tempfile_in(&self.tmp_dir)?)
    }

    fn props_path(path: &Path) -> PathBuf {
        let mut name = OsString::from(path.as_os_str());
        name.push(PROPS_SUFFIX);
        PathBuf::from(name)
    }

    fn read_properties(path: &Path) -> StoreResult<BlobProperties> {
        match fs::read(Self::props_path(path)) {
            Ok(data) => {
                serde_json::from_slice(&data).map_err(|e| StoreError::Serialization(e.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BlobProperties::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_properties(path: &Path, props: &BlobProperties) -> StoreResult<()> {
        let props_path = Self::props_path(path);
        if props.is_empty() {
            return remove_if_exists(&props_path);
        }
        let json = serde_json::to_vec(props).map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(props_path, json)?;
        Ok(())
    }

    /// Place a complete temp file at `dest`. With `dedup` an existing file is
    /// kept and the temp file discarded.
    fn persist(&self, tmp: NamedTempFile, dest: &Path, dedup: bool) -> StoreResult<bool> {
        if dedup && dest.exists() {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
        Ok(true)
    }

    fn move_file(&self, src: &Path, dest: &Path) -> StoreResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(src, dest) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Cross-device: copy through our temp dir, then remove the source.
                debug!(error = %e, "rename failed, falling back to copy");
                let mut tmp = self.create_temp_file()?;
                io::copy(&mut File::open(src)?, tmp.as_file_mut())?;
                tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
                remove_if_exists(src)
            }
        }
    }
}

fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn open_if_exists(path: &Path) -> StoreResult<Option<File>> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl BlobStore for LocalBlobStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_strategy(&self) -> &KeyStrategy {
        &self.key_strategy
    }

    fn write_blob(&self, ctx: &mut BlobWriteContext<'_>) -> StoreResult<String> {
        let mut tmp = self.create_temp_file()?;
        let len = transfer(ctx, tmp.as_file_mut())?;
        let key = ctx.storage_key()?;
        let dest = self.path_strategy.path_for_key(&key)?;
        let dedup = self.key_strategy.use_deduplication() && !ctx.has_storage_key();
        if self.persist(tmp, &dest, dedup)? {
            debug!(store = %self.name, key = %key, len, "wrote blob");
        } else {
            debug!(store = %self.name, key = %key, "blob already present");
        }
        Ok(key)
    }

    fn get_stream(&self, key: &str) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        let path = self.path_strategy.path_for_key(key)?;
        Ok(match open_if_exists(&path)? {
            Some(file) => OptionalOrUnknown::Present(Box::new(file)),
            None => OptionalOrUnknown::Missing,
        })
    }

    fn get_file(&self, key: &str) -> StoreResult<OptionalOrUnknown<PathBuf>> {
        let path = self.path_strategy.path_for_key(key)?;
        Ok(if path.is_file() {
            OptionalOrUnknown::Present(path)
        } else {
            OptionalOrUnknown::Missing
        })
    }

    fn get_stream_range(&self, key: &str, range: ByteRange) -> StoreResult<OptionalOrUnknown<BlobStream>> {
        let path = self.path_strategy.path_for_key(key)?;
        let Some(mut file) = open_if_exists(&path)? else {
            return Ok(OptionalOrUnknown::Missing);
        };
        file.seek(SeekFrom::Start(range.start()))?;
        Ok(OptionalOrUnknown::Present(Box::new(file.take(range.length()))))
    }

    fn read_blob(&self, key: &str, dest: &Path) -> StoreResult<bool> {
        let path = self.path_strategy.path_for_key(key)?;
        match fs::copy(&path, dest) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !path.exists() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn delete_blob(&self, key: &str) -> StoreResult<()> {
        let path = self.path_strategy.path_for_key(key)?;
        if Self::read_properties(&path)?.is_retained(Utc::now()) {
            return Err(StoreError::UnderRetention(key.to_string()));
        }
        remove_if_exists(&path)?;
        remove_if_exists(&Self::props_path(&path))?;
        debug!(store = %self.name, key, "deleted blob");
        Ok(())
    }

    fn copy_blob_is_optimized(&self, source: &dyn BlobStore) -> bool {
        source.as_any().is::<LocalBlobStore>()
    }

    fn copy_blob(
        &self,
        key: &str,
        source: &dyn BlobStore,
        source_key: &str,
        atomic_move: bool,
    ) -> StoreResult<bool> {
        let Some(other) = source.as_any().downcast_ref::<LocalBlobStore>() else {
            return copy_blob_generic(self, key, source, source_key, atomic_move);
        };
        let src = other.path_strategy.path_for_key(source_key)?;
        if !src.is_file() {
            return Ok(false);
        }
        let dest = self.path_strategy.path_for_key(key)?;
        if self.key_strategy.use_deduplication() && dest.exists() {
            debug!(store = %self.name, key, "copy target already present");
            if atomic_move {
                other.delete_blob(source_key)?;
            }
            return Ok(true);
        }
        if atomic_move {
            self.move_file(&src, &dest)?;
            let src_props = Self::props_path(&src);
            if src_props.exists() {
                self.move_file(&src_props, &Self::props_path(&dest))?;
            }
        } else {
            let mut tmp = self.create_temp_file()?;
            io::copy(&mut File::open(&src)?, tmp.as_file_mut())?;
            self.persist(tmp, &dest, false)?;
        }
        debug!(store = %self.name, key, source = %other.name, source_key, atomic_move, "copied blob");
        Ok(true)
    }

    fn write_blob_properties(&self, update: &BlobUpdateContext) -> StoreResult<()> {
        let path = self.path_strategy.path_for_key(&update.key)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(update.key.clone()));
        }
        let mut props = Self::read_properties(&path)?;
        props.apply(update);
        Self::write_properties(&path, &props)
    }

    fn blob_properties(&self, key: &str) -> StoreResult<BlobProperties> {
        let path = self.path_strategy.path_for_key(key)?;
        Self::read_properties(&path)
    }

    fn list_blobs(&self) -> StoreResult<Vec<BlobInfo>> {
        let mut infos = Vec::new();
        for entry in WalkDir::new(self.path_strategy.dir()).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(store = %self.name, error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(key) = entry.file_name().to_str() else {
                continue;
            };
            if key.ends_with(PROPS_SUFFIX) {
                continue;
            }
            let length = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let properties = Self::read_properties(entry.path())?;
            infos.push(BlobInfo {
                key: key.to_string(),
                length,
                properties,
            });
        }
        Ok(infos)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl std::fmt::Debug for LocalBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBlobStore")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("key_strategy", &self.key_strategy)
            .field("path_strategy", &self.path_strategy)
            .finish()
    }
}
