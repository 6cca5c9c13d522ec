//! Foundation types for the Strata blob store.
//!
//! This crate provides the value types shared by every layer of the storage
//! stack. Every other Strata crate depends on `strata-types`.
//!
//! # Key Types
//!
//! - [`OptionalOrUnknown`] — Tri-state lookup result: present, missing, or unanswerable
//! - [`ByteRange`] — Inclusive byte interval for partial reads
//! - [`BlobSource`] — Where the bytes of a write come from (memory or file)
//! - [`BlobContext`] — Immutable description of one write request
//! - [`BlobUpdateContext`] — Metadata-only update (legal hold, retention)
//! - [`BlobProperties`] — Persisted per-blob metadata

pub mod context;
pub mod error;
pub mod optional;
pub mod range;

pub use context::{BlobContext, BlobProperties, BlobSource, BlobUpdateContext, MAIN_BLOB_XPATH};
pub use error::TypeError;
pub use optional::OptionalOrUnknown;
pub use range::ByteRange;
