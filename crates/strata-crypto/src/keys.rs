use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CryptoError, CryptoResult};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// Salt length for password-derived keys.
pub const SALT_LEN: usize = 16;

/// PBKDF2 iteration count for password-derived keys.
pub const PBKDF2_ROUNDS: u32 = 10_000;

/// Which kind of key protects an envelope. The discriminant is the on-disk tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySourceKind {
    Keystore = 1,
    Password = 2,
}

impl KeySourceKind {
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    pub fn from_tag(tag: u8) -> CryptoResult<Self> {
        match tag {
            1 => Ok(Self::Keystore),
            2 => Ok(Self::Password),
            other => Err(CryptoError::UnknownKeySource(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Keystore => "keystore",
            Self::Password => "password",
        }
    }
}

/// A 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex key.
    pub fn from_hex(s: &str) -> CryptoResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim()).map_err(|e| CryptoError::Keystore(format!("invalid hex key: {e}")))?,
        );
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::Keystore(format!(
                "key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self(key))
    }

    /// Fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Derive a key from a password and salt with PBKDF2-HMAC-SHA256.
    pub fn derive_from_password(password: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
        Self(key)
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Where the encryption key of a store comes from.
#[derive(Clone)]
pub enum KeySource {
    /// One fixed key, taken from a keystore entry.
    Keystore(KeyMaterial),
    /// A password; each envelope derives its own key from a random salt.
    Password(Zeroizing<String>),
}

impl KeySource {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(Zeroizing::new(password.into()))
    }

    pub fn kind(&self) -> KeySourceKind {
        match self {
            Self::Keystore(_) => KeySourceKind::Keystore,
            Self::Password(_) => KeySourceKind::Password,
        }
    }

    /// The key protecting an envelope. `salt` is required in password mode
    /// and ignored in keystore mode.
    pub(crate) fn resolve(&self, salt: Option<&[u8]>) -> CryptoResult<KeyMaterial> {
        match (self, salt) {
            (Self::Keystore(key), _) => Ok(key.clone()),
            (Self::Password(password), Some(salt)) => {
                Ok(KeyMaterial::derive_from_password(password, salt))
            }
            (Self::Password(_), None) => Err(CryptoError::Truncated("missing salt")),
        }
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySource::{}", self.kind().name())
    }
}

#[derive(Deserialize)]
struct KeystoreFile {
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

/// Named hex-encoded keys loaded from a TOML file:
///
/// ```toml
/// [keys]
/// blobs = "00112233..."
/// ```
pub struct Keystore {
    keys: BTreeMap<String, Zeroizing<String>>,
}

impl Keystore {
    pub fn load(path: &Path) -> CryptoResult<Self> {
        let text = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> CryptoResult<Self> {
        let file: KeystoreFile =
            toml::from_str(text).map_err(|e| CryptoError::Keystore(e.to_string()))?;
        let keys = file
            .keys
            .into_iter()
            .map(|(alias, hex)| (alias, Zeroizing::new(hex)))
            .collect();
        Ok(Self { keys })
    }

    /// Look up and decode the key stored under `alias`.
    pub fn key(&self, alias: &str) -> CryptoResult<KeyMaterial> {
        let hex = self
            .keys
            .get(alias)
            .ok_or_else(|| CryptoError::Keystore(format!("no key with alias {alias:?}")))?;
        KeyMaterial::from_hex(hex)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

impl fmt::Debug for Keystore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keystore")
            .field("aliases", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn tag_roundtrip_and_unknown() {
        assert_eq!(KeySourceKind::from_tag(1).unwrap(), KeySourceKind::Keystore);
        assert_eq!(KeySourceKind::from_tag(2).unwrap(), KeySourceKind::Password);
        assert!(matches!(KeySourceKind::from_tag(7), Err(CryptoError::UnknownKeySource(7))));
    }

    #[test]
    fn password_derivation_depends_on_salt() {
        let a = KeyMaterial::derive_from_password("secret", &[1u8; SALT_LEN]);
        let b = KeyMaterial::derive_from_password("secret", &[1u8; SALT_LEN]);
        let c = KeyMaterial::derive_from_password("secret", &[2u8; SALT_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn keystore_lookup() {
        let ks = Keystore::from_toml_str(&format!("[keys]\nblobs = \"{HEX_KEY}\"\n")).unwrap();
        let key = ks.key("blobs").unwrap();
        assert_eq!(key.as_bytes()[31], 0x1f);
        assert!(matches!(ks.key("other"), Err(CryptoError::Keystore(_))));
        assert_eq!(ks.aliases().collect::<Vec<_>>(), vec!["blobs"]);
    }

    #[test]
    fn keystore_rejects_short_key() {
        let ks = Keystore::from_toml_str("[keys]\nshort = \"0011\"\n").unwrap();
        assert!(matches!(ks.key("short"), Err(CryptoError::Keystore(_))));
    }

    #[test]
    fn debug_redacts_key() {
        let key = KeyMaterial::from_hex(HEX_KEY).unwrap();
        assert_eq!(format!("{key:?}"), "KeyMaterial(<redacted>)");
        assert_eq!(format!("{:?}", KeySource::password("pw")), "KeySource::password");
    }

    #[test]
    fn keystore_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystore.toml");
        std::fs::write(&path, format!("[keys]\nblobs = \"{HEX_KEY}\"\n")).unwrap();
        let ks = Keystore::load(&path).unwrap();
        assert_eq!(ks.key("blobs").unwrap(), KeyMaterial::from_hex(HEX_KEY).unwrap());
        assert!(matches!(Keystore::load(&dir.path().join("absent.toml")), Err(CryptoError::Io(_))));
    }
}
