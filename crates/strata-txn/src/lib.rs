//! Transactional staging for Strata blob stores.
//!
//! Most blob backends (plain files, in-memory maps) know nothing about
//! transactions. [`TransactionalBlobStore`] makes writes and deletes atomic
//! with respect to a [`Transaction`] anyway: inside a transaction new bytes
//! are staged and deletes recorded, and only commit touches the permanent
//! store.
//!
//! # Lifecycle
//!
//! ```text
//! let tx = Transaction::begin();
//! let view = store.bind(&tx);   // BlobStore with staged semantics
//! view.write(&blob)?;           // staged, visible to this view only
//! tx.commit();                  // staged bytes moved into the permanent store
//! ```
//!
//! # Design Rules
//!
//! 1. One open transaction holds a key at a time; a second one fails fast
//!    with `ConcurrentUpdate` and leaves no staged bytes behind.
//! 2. Later writes in the same transaction supersede earlier ones; the
//!    superseded staged bytes are deleted immediately.
//! 3. A view reads its own staged state first, then the permanent store.
//! 4. Commit is best effort per key: a failing key is logged and skipped.
//! 5. Rollback deletes every staged object; the permanent store is untouched.

pub mod store;
pub mod transaction;
pub mod view;

pub use store::TransactionalBlobStore;
pub use transaction::{Synchronization, Transaction, TransactionId, TransactionStatus};
pub use view::TransactionalView;
