use std::fmt;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};

use crate::error::CryptoError;

/// Content digest algorithm used to derive blob keys.
///
/// Digest keys are always rendered as lowercase hex, so the key length is
/// fixed per algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    #[default]
    #[serde(rename = "MD5")]
    Md5,
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-512")]
    Sha512,
    #[serde(rename = "BLAKE3")]
    Blake3,
}

impl DigestAlgorithm {
    /// Canonical algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha256 => "SHA-256",
            Self::Sha512 => "SHA-512",
            Self::Blake3 => "BLAKE3",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha256 | Self::Blake3 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Length of the hex rendering.
    pub fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Returns `true` if `key` could have been produced by this algorithm.
    pub fn is_valid_digest(&self, key: &str) -> bool {
        key.len() == self.hex_len()
            && key.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    /// Start an incremental digest.
    pub fn digester(&self) -> Digester {
        match self {
            Self::Md5 => Digester::Md5(Md5::new()),
            Self::Sha256 => Digester::Sha256(Sha256::new()),
            Self::Sha512 => Digester::Sha512(Sha512::new()),
            Self::Blake3 => Digester::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// One-shot lowercase hex digest.
    pub fn hex_digest(&self, data: &[u8]) -> String {
        let mut digester = self.digester();
        digester.update(data);
        digester.finalize_hex()
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "MD5" => Ok(Self::Md5),
            "SHA-256" | "SHA256" => Ok(Self::Sha256),
            "SHA-512" | "SHA512" => Ok(Self::Sha512),
            "BLAKE3" => Ok(Self::Blake3),
            _ => Err(CryptoError::UnknownDigest(s.to_string())),
        }
    }
}

/// Rolling digest over bytes fed in arbitrary chunks.
pub enum Digester {
    Md5(Md5),
    Sha256(Sha256),
    Sha512(Sha512),
    Blake3(Box<blake3::Hasher>),
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
            Self::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Finish and render as lowercase hex.
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
            Self::Blake3(h) => hex::encode(h.finalize().as_bytes()),
        }
    }
}

impl fmt::Debug for Digester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self {
            Self::Md5(_) => DigestAlgorithm::Md5,
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
            Self::Blake3(_) => DigestAlgorithm::Blake3,
        };
        f.debug_tuple("Digester").field(&algorithm).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn known_md5_vector() {
        assert_eq!(
            DigestAlgorithm::Md5.hex_digest(b"hello world"),
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
    }

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            DigestAlgorithm::Sha256.hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn chunked_update_matches_one_shot() {
        for algo in [
            DigestAlgorithm::Md5,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha512,
            DigestAlgorithm::Blake3,
        ] {
            let mut d = algo.digester();
            d.update(b"hello ");
            d.update(b"world");
            let hex = d.finalize_hex();
            assert_eq!(hex, algo.hex_digest(b"hello world"));
            assert_eq!(hex.len(), algo.hex_len());
            assert!(algo.is_valid_digest(&hex));
        }
    }

    #[test]
    fn parse_names() {
        assert_eq!("md5".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Md5);
        assert_eq!("SHA-256".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha256);
        assert_eq!("sha512".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Sha512);
        assert_eq!("blake3".parse::<DigestAlgorithm>().unwrap(), DigestAlgorithm::Blake3);
        assert!(matches!(
            "crc32".parse::<DigestAlgorithm>(),
            Err(CryptoError::UnknownDigest(_))
        ));
    }

    #[test]
    fn invalid_digest_shapes() {
        let algo = DigestAlgorithm::Md5;
        assert!(!algo.is_valid_digest("abc"));
        assert!(!algo.is_valid_digest("5EB63BBBE01EEED093CB22BB8F5ACDC3"));
        assert!(!algo.is_valid_digest("5eb63bbbe01eeed093cb22bb8f5acdcz"));
        assert!(!algo.is_valid_digest("tmp"));
    }

    proptest! {
        #[test]
        fn digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..2048)) {
            prop_assert_eq!(
                DigestAlgorithm::Sha256.hex_digest(&data),
                DigestAlgorithm::Sha256.hex_digest(&data)
            );
        }

        #[test]
        fn distinct_content_distinct_digest(a in proptest::collection::vec(any::<u8>(), 0..256),
                                            b in proptest::collection::vec(any::<u8>(), 0..256)) {
            prop_assume!(a != b);
            prop_assert_ne!(DigestAlgorithm::Md5.hex_digest(&a), DigestAlgorithm::Md5.hex_digest(&b));
        }
    }
}
