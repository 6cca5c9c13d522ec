use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attachment path of a document's primary content.
pub const MAIN_BLOB_XPATH: &str = "content";

/// Origin of the bytes being written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobSource {
    /// Content already held in memory.
    Bytes(Bytes),
    /// Content in a local file. Stores may read the file directly instead of
    /// copying it through a temporary file.
    File(PathBuf),
}

impl BlobSource {
    /// Open a fresh reader over the content.
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            Self::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Self::File(path) => Ok(Box::new(File::open(path)?)),
        }
    }

    /// The backing file, when the source already is one.
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::Bytes(_) => None,
            Self::File(path) => Some(path),
        }
    }

    /// Content length when cheaply known.
    pub fn length(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::File(path) => std::fs::metadata(path).ok().map(|m| m.len()),
        }
    }
}

impl From<Vec<u8>> for BlobSource {
    fn from(data: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(data))
    }
}

impl From<&'static [u8]> for BlobSource {
    fn from(data: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(data))
    }
}

impl From<PathBuf> for BlobSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

/// Immutable description of one write request.
///
/// Created once per write and never mutated afterwards; a key strategy reads
/// it to decide how the storage key is derived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobContext {
    pub source: BlobSource,
    /// Key already assigned by the store that manages this blob, if any.
    pub managed_key: Option<String>,
    pub doc_id: Option<String>,
    pub repository: Option<String>,
    pub xpath: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
}

impl BlobContext {
    /// Context for content not attached to any document.
    pub fn new(source: impl Into<BlobSource>) -> Self {
        Self {
            source: source.into(),
            managed_key: None,
            doc_id: None,
            repository: None,
            xpath: MAIN_BLOB_XPATH.to_string(),
            filename: None,
            mime_type: None,
        }
    }

    pub fn with_document(mut self, repository: impl Into<String>, doc_id: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn with_xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = xpath.into();
        self
    }

    pub fn with_managed_key(mut self, key: impl Into<String>) -> Self {
        self.managed_key = Some(key.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Returns `true` if this write targets the document's primary content.
    pub fn is_main_blob(&self) -> bool {
        self.xpath == MAIN_BLOB_XPATH
    }
}

/// Metadata-only update applied to an existing blob.
///
/// A `None` field leaves the corresponding property untouched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobUpdateContext {
    pub key: String,
    pub legal_hold: Option<bool>,
    /// `Some(None)` clears the retention date.
    pub retain_until: Option<Option<DateTime<Utc>>>,
}

impl BlobUpdateContext {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            legal_hold: None,
            retain_until: None,
        }
    }

    pub fn with_legal_hold(mut self, hold: bool) -> Self {
        self.legal_hold = Some(hold);
        self
    }

    pub fn with_retain_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.retain_until = Some(until);
        self
    }

    /// Fold a later update for the same key into this one. Later values win.
    pub fn merge(&mut self, later: BlobUpdateContext) {
        if later.legal_hold.is_some() {
            self.legal_hold = later.legal_hold;
        }
        if later.retain_until.is_some() {
            self.retain_until = later.retain_until;
        }
    }
}

/// Persisted per-blob metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    #[serde(default)]
    pub legal_hold: bool,
    #[serde(default)]
    pub retain_until: Option<DateTime<Utc>>,
}

impl BlobProperties {
    /// Apply an update's set fields.
    pub fn apply(&mut self, update: &BlobUpdateContext) {
        if let Some(hold) = update.legal_hold {
            self.legal_hold = hold;
        }
        if let Some(until) = update.retain_until {
            self.retain_until = until;
        }
    }

    /// Returns `true` if the blob must not be deleted at `now`.
    pub fn is_retained(&self, now: DateTime<Utc>) -> bool {
        self.legal_hold || self.retain_until.is_some_and(|until| until > now)
    }

    /// Returns `true` if no property is set (nothing worth persisting).
    pub fn is_empty(&self) -> bool {
        !self.legal_hold && self.retain_until.is_none()
    }
}
