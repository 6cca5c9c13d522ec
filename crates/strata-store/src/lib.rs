//! Content-addressable blob storage for Strata.
//!
//! A blob is an opaque byte sequence stored independently of the record that
//! references it. Every blob lives under a key chosen by a [`KeyStrategy`]:
//! the content digest (deduplicating), the owning document id, or a key the
//! blob already carries. File-backed stores map keys to paths through a
//! [`PathStrategy`].
//!
//! # Storage Backends
//!
//! All backends implement the [`BlobStore`] trait:
//!
//! - [`InMemoryBlobStore`] -- `HashMap`-based store for tests, staging, and embedding
//! - [`LocalBlobStore`] -- one file per blob under a root directory
//! - [`AesBlobStore`] -- encrypting decorator over any other store
//! - [`CachingBlobStore`] -- local file cache in front of a slower store
//!
//! [`open_store`] builds a stack from a [`StoreConfig`]. [`GarbageCollector`]
//! sweeps blobs no longer referenced.
//!
//! # Design Rules
//!
//! 1. A write pulls its source once; the key is known only after the last byte.
//! 2. A blob becomes visible under its key only once it is complete.
//! 3. Absence is a result (`Missing`, `false`), never an error.
//! 4. `Unknown` means "try another access path", never "does not exist".
//! 5. Blobs under legal hold or retention are never deleted.
//! 6. All I/O errors are propagated, except skipped best-effort cleanups which are logged.

pub mod aes;
pub mod caching;
pub mod config;
pub mod error;
pub mod gc;
pub mod key;
pub mod local;
pub mod memory;
pub mod path;
pub mod traits;
pub mod write;

// Re-export primary types at crate root for ergonomic imports.
pub use aes::AesBlobStore;
pub use caching::{CacheConfig, CacheStats, CachingBlobStore};
pub use config::{open_store, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use gc::{GarbageCollector, GcStatus};
pub use key::{base_key, KeyStrategy, VERSION_SEPARATOR};
pub use local::LocalBlobStore;
pub use memory::InMemoryBlobStore;
pub use path::PathStrategy;
pub use traits::{copy_blob_generic, slice_stream, BlobInfo, BlobStore, BlobStream};
pub use write::{transfer, BlobWriteContext, DigestObserver, KeySupplier, WriteObserver};
