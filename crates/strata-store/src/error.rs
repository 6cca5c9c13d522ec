use strata_crypto::CryptoError;
use strata_types::TypeError;

/// Errors from blob store operations.
///
/// Absence of a blob is not an error for reads and copies; those operations
/// report it through `bool` or [`OptionalOrUnknown`](strata_types::OptionalOrUnknown).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Invalid or inconsistent store configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The key cannot be mapped to a storage location.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The write completed without the key strategy producing a key.
    #[error("missing key: write observer did not resolve a key")]
    MissingKey,

    /// A metadata update targeted a blob that does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Another open transaction already holds this key.
    #[error("concurrent update on blob {key}")]
    ConcurrentUpdate { key: String },

    /// The blob is under legal hold or unexpired retention.
    #[error("blob {0} is under retention and cannot be deleted")]
    UnderRetention(String),

    /// Envelope or key handling failure in the encrypting store.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns `true` if the stored bytes are not a valid envelope.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::Crypto(e) if e.is_format_error())
    }

    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, Self::ConcurrentUpdate { .. })
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
