use thiserror::Error;

/// Errors from digesting, key handling, and envelope encoding/decoding.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown digest algorithm: {0}")]
    UnknownDigest(String),

    #[error("invalid envelope magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown key source tag: {0}")]
    UnknownKeySource(u8),

    #[error("key source mismatch: envelope uses {found}, store is configured for {expected}")]
    KeySourceMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("implausible {field} length {length} (max {max})")]
    FieldLength {
        field: &'static str,
        length: u32,
        max: u32,
    },

    #[error("truncated envelope: {0}")]
    Truncated(&'static str),

    #[error("authentication failed: ciphertext was tampered with or the key is wrong")]
    Authentication,

    #[error("keystore error: {0}")]
    Keystore(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Returns `true` for errors that mean the stored data is not a valid
    /// envelope for this reader.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic { .. }
                | Self::UnsupportedVersion(_)
                | Self::UnknownKeySource(_)
                | Self::KeySourceMismatch { .. }
                | Self::FieldLength { .. }
                | Self::Truncated(_)
                | Self::Authentication
        )
    }
}

/// Result alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
