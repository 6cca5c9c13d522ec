use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use strata_crypto::{DigestAlgorithm, Digester};
use strata_types::BlobContext;

use crate::error::{StoreError, StoreResult};

/// Transfer buffer size.
const BUFFER_SIZE: usize = 64 * 1024;

/// Sees every byte of a write as it flows to storage.
pub trait WriteObserver: Send {
    fn write(&mut self, buf: &[u8]);

    /// Called once, after the last byte.
    fn done(&mut self);

    /// The key derived from the observed bytes, available after [`done`](Self::done).
    fn key(&self) -> Option<String> {
        None
    }
}

/// Computes a content digest over the written bytes; the digest is the key.
pub struct DigestObserver {
    algorithm: DigestAlgorithm,
    digester: Option<Digester>,
    digest: Option<String>,
}

impl DigestObserver {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self {
            algorithm,
            digester: Some(algorithm.digester()),
            digest: None,
        }
    }
}

impl WriteObserver for DigestObserver {
    fn write(&mut self, buf: &[u8]) {
        if let Some(digester) = self.digester.as_mut() {
            digester.update(buf);
        }
    }

    fn done(&mut self) {
        if let Some(digester) = self.digester.take() {
            self.digest = Some(digester.finalize_hex());
        }
    }

    fn key(&self) -> Option<String> {
        self.digest.clone()
    }
}

impl fmt::Debug for DigestObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestObserver")
            .field("algorithm", &self.algorithm)
            .field("digest", &self.digest)
            .finish()
    }
}

/// How the key of a write is obtained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeySupplier {
    /// Known before any byte is written.
    Fixed(String),
    /// Produced by the write observer once the transfer is done.
    Observed,
}

/// Per-write state derived from a [`BlobContext`] and a key strategy.
///
/// Lives for one write call: bytes are pulled from the source once, shown to
/// the observer, and the key is resolved afterwards.
pub struct BlobWriteContext<'a> {
    blob_context: Option<&'a BlobContext>,
    stream: Option<Box<dyn Read + Send + 'a>>,
    observer: Option<Box<dyn WriteObserver>>,
    key: KeySupplier,
    storage_key: Option<String>,
    file: Option<PathBuf>,
    observed: bool,
}

impl<'a> BlobWriteContext<'a> {
    pub fn new(
        blob_context: &'a BlobContext,
        observer: Option<Box<dyn WriteObserver>>,
        key: KeySupplier,
    ) -> Self {
        Self {
            blob_context: Some(blob_context),
            stream: None,
            observer,
            key,
            storage_key: None,
            file: None,
            observed: false,
        }
    }

    /// Context for writing raw bytes under a known key (copies between stores).
    pub fn from_reader(key: impl Into<String>, reader: Box<dyn Read + Send + 'a>) -> Self {
        Self {
            blob_context: None,
            stream: Some(reader),
            observer: None,
            key: KeySupplier::Fixed(key.into()),
            storage_key: None,
            file: None,
            observed: false,
        }
    }

    /// Context for writing a local file under a known key.
    pub fn from_file(key: impl Into<String>, path: &Path) -> StoreResult<Self> {
        let mut ctx = Self::from_reader(key, Box::new(File::open(path)?));
        ctx.file = Some(path.to_path_buf());
        Ok(ctx)
    }

    pub fn blob_context(&self) -> Option<&'a BlobContext> {
        self.blob_context
    }

    /// A local file holding the complete content, if one exists already.
    pub fn file(&self) -> Option<&Path> {
        self.file
            .as_deref()
            .or_else(|| self.blob_context.and_then(|ctx| ctx.source.file()))
    }

    /// Record that the content was staged to `path` and already observed.
    pub fn set_file(&mut self, path: PathBuf) {
        self.file = Some(path);
    }

    /// Store the bytes under `key` instead of the strategy's key. The logical
    /// key returned by [`key`](Self::key) is unaffected.
    pub fn set_storage_key(&mut self, key: impl Into<String>) {
        self.storage_key = Some(key.into());
    }

    pub fn has_storage_key(&self) -> bool {
        self.storage_key.is_some()
    }

    pub fn has_observer(&self) -> bool {
        self.observer.is_some()
    }

    /// The logical key. Fails if the key comes from the observer and the
    /// transfer has not completed.
    pub fn key(&self) -> StoreResult<String> {
        match &self.key {
            KeySupplier::Fixed(key) => Ok(key.clone()),
            KeySupplier::Observed => self
                .observer
                .as_ref()
                .and_then(|o| o.key())
                .ok_or(StoreError::MissingKey),
        }
    }

    /// The key the store must write under.
    pub fn storage_key(&self) -> StoreResult<String> {
        match &self.storage_key {
            Some(key) => Ok(key.clone()),
            None => self.key(),
        }
    }

    fn open_source(&mut self) -> io::Result<Box<dyn Read + Send + 'a>> {
        if let Some(stream) = self.stream.take() {
            return Ok(stream);
        }
        if let Some(path) = &self.file {
            return Ok(Box::new(File::open(path)?));
        }
        match self.blob_context {
            Some(ctx) => ctx.source.open(),
            None => Err(io::Error::new(
                io::ErrorKind::Other,
                "write source already consumed",
            )),
        }
    }

    fn observe(&mut self, buf: &[u8]) {
        if self.observed {
            return;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.write(buf);
        }
    }

    fn finish_observing(&mut self) {
        if self.observed {
            return;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.done();
        }
        self.observed = true;
    }
}

impl fmt::Debug for BlobWriteContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriteContext")
            .field("key", &self.key)
            .field("storage_key", &self.storage_key)
            .field("file", &self.file)
            .field("observed", &self.observed)
            .finish()
    }
}

/// Pump the write source into `out`, feeding the observer on the way.
///
/// Returns the number of bytes transferred. After this returns the context's
/// key is resolvable.
pub fn transfer<W: Write + ?Sized>(ctx: &mut BlobWriteContext<'_>, out: &mut W) -> StoreResult<u64> {
    let mut source = ctx.open_source()?;
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        ctx.observe(&buf[..n]);
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
    out.flush()?;
    ctx.finish_observing();
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::BlobSource;

    #[test]
    fn observed_key_resolves_after_transfer() {
        let blob = BlobContext::new(b"hello world".to_vec());
        let mut ctx = BlobWriteContext::new(
            &blob,
            Some(Box::new(DigestObserver::new(DigestAlgorithm::Md5))),
            KeySupplier::Observed,
        );
        assert!(matches!(ctx.key(), Err(StoreError::MissingKey)));

        let mut out = Vec::new();
        let n = transfer(&mut ctx, &mut out).unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, b"hello world");
        assert_eq!(ctx.key().unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn storage_key_override_keeps_logical_key() {
        let blob = BlobContext::new(b"x".to_vec());
        let mut ctx = BlobWriteContext::new(&blob, None, KeySupplier::Fixed("logical".into()));
        assert_eq!(ctx.storage_key().unwrap(), "logical");
        ctx.set_storage_key("staged");
        assert_eq!(ctx.storage_key().unwrap(), "staged");
        assert_eq!(ctx.key().unwrap(), "logical");
    }

    #[test]
    fn second_transfer_from_staged_file_does_not_reobserve() {
        let dir = tempfile::tempdir().unwrap();
        let blob = BlobContext::new(b"abc".to_vec());
        let mut ctx = BlobWriteContext::new(
            &blob,
            Some(Box::new(DigestObserver::new(DigestAlgorithm::Sha256))),
            KeySupplier::Observed,
        );
        let staged = dir.path().join("staged");
        let mut file = File::create(&staged).unwrap();
        transfer(&mut ctx, &mut file).unwrap();
        let key = ctx.key().unwrap();

        ctx.set_file(staged);
        let mut out = Vec::new();
        transfer(&mut ctx, &mut out).unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(ctx.key().unwrap(), key);
    }

    #[test]
    fn reader_context_is_single_use() {
        let mut ctx = BlobWriteContext::from_reader("k", Box::new(io::Cursor::new(b"data".to_vec())));
        let mut out = Vec::new();
        transfer(&mut ctx, &mut out).unwrap();
        assert_eq!(out, b"data");
        assert!(transfer(&mut ctx, &mut Vec::new()).is_err());
    }

    #[test]
    fn file_source_is_exposed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.bin");
        std::fs::write(&path, b"file content").unwrap();
        let blob = BlobContext::new(BlobSource::File(path.clone()));
        let ctx = BlobWriteContext::new(&blob, None, KeySupplier::Fixed("k".into()));
        assert_eq!(ctx.file(), Some(path.as_path()));
    }
}
