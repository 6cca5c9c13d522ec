//! Cryptographic primitives for the Strata blob store.
//!
//! Provides the streaming content digests used to derive deduplicating blob
//! keys, and the versioned encryption envelope written by the encrypting
//! store.
//!
//! All crypto operations wrap established libraries. No custom cryptography.
//!
//! # Envelope layout
//!
//! ```text
//! 10 bytes  magic "NUXEOCRYPT"
//!  1 byte   format version (1)
//!  1 byte   key source: 1 = keystore, 2 = password-derived
//! [password-derived only] u32 BE salt length + salt
//! u32 BE IV length + IV
//! AES-256-GCM STREAM ciphertext
//! ```

pub mod envelope;
pub mod error;
pub mod hasher;
pub mod keys;

pub use envelope::{crypto_error_from_io, DecryptingReader, EncryptingWriter, EnvelopeHeader, MAX_FIELD_LEN};
pub use error::{CryptoError, CryptoResult};
pub use hasher::{DigestAlgorithm, Digester};
pub use keys::{KeyMaterial, KeySource, KeySourceKind, Keystore};
