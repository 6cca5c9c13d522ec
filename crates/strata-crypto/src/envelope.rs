use std::io::{self, ErrorKind, Read, Write};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::stream::{DecryptorBE32, EncryptorBE32};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use rand::RngCore;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::{KeyMaterial, KeySource, KeySourceKind, SALT_LEN};

/// Envelope magic bytes.
pub const MAGIC: &[u8; 10] = b"NUXEOCRYPT";

/// Current (and only) envelope format version.
pub const VERSION: u8 = 1;

/// Upper bound accepted for the salt and IV length fields.
pub const MAX_FIELD_LEN: u32 = 1024;

/// STREAM nonce prefix length for AES-256-GCM (12-byte nonce minus the
/// 5-byte counter/last-block suffix).
pub const IV_LEN: usize = 7;

/// Plaintext bytes per authenticated segment.
pub const SEGMENT_LEN: usize = 64 * 1024;

/// GCM tag appended to every segment.
const TAG_LEN: usize = 16;

const CIPHER_SEGMENT_LEN: usize = SEGMENT_LEN + TAG_LEN;

/// Cleartext header preceding the encrypted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub key_source: KeySourceKind,
    /// Present only for password-derived keys.
    pub salt: Option<Vec<u8>>,
    pub iv: Vec<u8>,
}

impl EnvelopeHeader {
    /// Serialize the header in its fixed field order.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_all(MAGIC)?;
        out.write_all(&[VERSION, self.key_source.tag()])?;
        if let Some(salt) = &self.salt {
            out.write_all(&(salt.len() as u32).to_be_bytes())?;
            out.write_all(salt)?;
        }
        out.write_all(&(self.iv.len() as u32).to_be_bytes())?;
        out.write_all(&self.iv)
    }

    /// Parse and validate a header, checking the key source against the one
    /// the reader is configured with.
    pub fn read_from<R: Read>(input: &mut R, expected: KeySourceKind) -> CryptoResult<Self> {
        let mut magic = [0u8; 10];
        read_exact(input, &mut magic, "magic")?;
        if &magic != MAGIC {
            return Err(CryptoError::InvalidMagic {
                expected: String::from_utf8_lossy(MAGIC).into(),
                actual: String::from_utf8_lossy(&magic).into(),
            });
        }

        let mut fixed = [0u8; 2];
        read_exact(input, &mut fixed, "version")?;
        if fixed[0] != VERSION {
            return Err(CryptoError::UnsupportedVersion(fixed[0]));
        }
        let key_source = KeySourceKind::from_tag(fixed[1])?;
        if key_source != expected {
            return Err(CryptoError::KeySourceMismatch {
                expected: expected.name(),
                found: key_source.name(),
            });
        }

        let salt = match key_source {
            KeySourceKind::Password => Some(read_field(input, "salt")?),
            KeySourceKind::Keystore => None,
        };
        let iv = read_field(input, "IV")?;
        if iv.len() != IV_LEN {
            return Err(CryptoError::FieldLength {
                field: "IV",
                length: iv.len() as u32,
                max: IV_LEN as u32,
            });
        }

        Ok(Self {
            key_source,
            salt,
            iv,
        })
    }
}

fn read_exact<R: Read>(input: &mut R, buf: &mut [u8], what: &'static str) -> CryptoResult<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => CryptoError::Truncated(what),
        _ => CryptoError::Io(e),
    })
}

/// Read a u32 BE length-prefixed field, bounding the length before allocating.
fn read_field<R: Read>(input: &mut R, field: &'static str) -> CryptoResult<Vec<u8>> {
    let mut len = [0u8; 4];
    read_exact(input, &mut len, field)?;
    let length = u32::from_be_bytes(len);
    if length == 0 || length > MAX_FIELD_LEN {
        return Err(CryptoError::FieldLength {
            field,
            length,
            max: MAX_FIELD_LEN,
        });
    }
    let mut value = vec![0u8; length as usize];
    read_exact(input, &mut value, field)?;
    Ok(value)
}

fn cipher_for(key: &KeyMaterial) -> Aes256Gcm {
    Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
}

fn auth_error() -> io::Error {
    io::Error::new(ErrorKind::InvalidData, CryptoError::Authentication)
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Writes an envelope header, then encrypts everything written through it.
///
/// [`finish`](Self::finish) must be called to seal the final segment; an
/// unfinished envelope fails authentication on read.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    encryptor: Option<EncryptorBE32<Aes256Gcm>>,
    buffer: Vec<u8>,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, source: &KeySource) -> CryptoResult<Self> {
        let mut rng = rand::thread_rng();
        let salt = match source.kind() {
            KeySourceKind::Password => {
                let mut salt = vec![0u8; SALT_LEN];
                rng.fill_bytes(&mut salt);
                Some(salt)
            }
            KeySourceKind::Keystore => None,
        };
        let mut iv = vec![0u8; IV_LEN];
        rng.fill_bytes(&mut iv);

        let key = source.resolve(salt.as_deref())?;
        let header = EnvelopeHeader {
            key_source: source.kind(),
            salt,
            iv,
        };
        header.write_to(&mut inner)?;

        let encryptor = EncryptorBE32::from_aead(cipher_for(&key), GenericArray::from_slice(&header.iv));
        Ok(Self {
            inner,
            encryptor: Some(encryptor),
            buffer: Vec::with_capacity(SEGMENT_LEN),
        })
    }

    /// Seal the last segment and return the inner writer.
    pub fn finish(mut self) -> CryptoResult<W> {
        let encryptor = self
            .encryptor
            .take()
            .ok_or(CryptoError::Truncated("envelope already finished"))?;
        let sealed = encryptor
            .encrypt_last(self.buffer.as_slice())
            .map_err(|_| CryptoError::Authentication)?;
        self.inner.write_all(&sealed)?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn flush_full_segments(&mut self) -> io::Result<()> {
        // Keep at least one byte buffered: the last segment is only known at finish().
        while self.buffer.len() > SEGMENT_LEN {
            let encryptor = self
                .encryptor
                .as_mut()
                .ok_or_else(|| io::Error::new(ErrorKind::Other, "envelope already finished"))?;
            let sealed = encryptor
                .encrypt_next(&self.buffer[..SEGMENT_LEN])
                .map_err(|_| auth_error())?;
            self.inner.write_all(&sealed)?;
            self.buffer.drain(..SEGMENT_LEN);
        }
        Ok(())
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.flush_full_segments()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Validates an envelope header, then decrypts the payload as it is read.
pub struct DecryptingReader<R: Read> {
    inner: R,
    decryptor: Option<DecryptorBE32<Aes256Gcm>>,
    pending: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> DecryptingReader<R> {
    pub fn new(mut inner: R, source: &KeySource) -> CryptoResult<Self> {
        let header = EnvelopeHeader::read_from(&mut inner, source.kind())?;
        let key = source.resolve(header.salt.as_deref())?;
        let decryptor = DecryptorBE32::from_aead(cipher_for(&key), GenericArray::from_slice(&header.iv));
        Ok(Self {
            inner,
            decryptor: Some(decryptor),
            pending: Vec::with_capacity(CIPHER_SEGMENT_LEN + 1),
            plain: Vec::new(),
            pos: 0,
            eof: false,
        })
    }

    /// Decrypt the next segment into `plain`. Returns `false` once the last
    /// segment has been consumed.
    fn next_segment(&mut self) -> io::Result<bool> {
        if self.decryptor.is_none() {
            return Ok(false);
        }
        // One byte of lookahead tells a full middle segment from the last one.
        while !self.eof && self.pending.len() <= CIPHER_SEGMENT_LEN {
            let mut chunk = [0u8; 8192];
            let want = (CIPHER_SEGMENT_LEN + 1 - self.pending.len()).min(chunk.len());
            let n = self.inner.read(&mut chunk[..want])?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&chunk[..n]);
            }
        }

        self.plain = if self.pending.len() > CIPHER_SEGMENT_LEN {
            let decryptor = self.decryptor.as_mut().ok_or_else(auth_error)?;
            let plain = decryptor
                .decrypt_next(&self.pending[..CIPHER_SEGMENT_LEN])
                .map_err(|_| auth_error())?;
            self.pending.drain(..CIPHER_SEGMENT_LEN);
            plain
        } else {
            let decryptor = self.decryptor.take().ok_or_else(auth_error)?;
            let plain = decryptor
                .decrypt_last(self.pending.as_slice())
                .map_err(|_| auth_error())?;
            self.pending.clear();
            plain
        };
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if !self.next_segment()? {
                return Ok(0);
            }
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Extract the crypto error carried by an I/O error raised while decrypting.
pub fn crypto_error_from_io(err: io::Error) -> CryptoError {
    if err.get_ref().is_some_and(|inner| inner.is::<CryptoError>()) {
        if let Some(inner) = err.into_inner() {
            if let Ok(crypto) = inner.downcast::<CryptoError>() {
                return *crypto;
            }
        }
        return CryptoError::Authentication;
    }
    CryptoError::Io(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use proptest::prelude::*;

    fn keystore_source() -> KeySource {
        KeySource::Keystore(KeyMaterial::from_bytes([7u8; 32]))
    }

    fn seal(data: &[u8], source: &KeySource) -> Vec<u8> {
        let mut writer = EncryptingWriter::new(Vec::new(), source).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap()
    }

    fn open(envelope: &[u8], source: &KeySource) -> CryptoResult<Vec<u8>> {
        let mut reader = DecryptingReader::new(envelope, source)?;
        let mut out = Vec::new();
        reader.read_to_end(&mut out).map_err(crypto_error_from_io)?;
        Ok(out)
    }

    #[test]
    fn keystore_header_layout() {
        let envelope = seal(b"payload", &keystore_source());
        assert_eq!(&envelope[..10], b"NUXEOCRYPT");
        assert_eq!(envelope[10], 1);
        assert_eq!(envelope[11], 1);
        assert_eq!(&envelope[12..16], &(IV_LEN as u32).to_be_bytes());
        // header + iv + ciphertext(7) + tag
        assert_eq!(envelope.len(), 16 + IV_LEN + 7 + TAG_LEN);
    }

    #[test]
    fn password_header_carries_salt() {
        let source = KeySource::password("hunter2");
        let envelope = seal(b"payload", &source);
        assert_eq!(envelope[11], 2);
        assert_eq!(&envelope[12..16], &(SALT_LEN as u32).to_be_bytes());
        assert_eq!(open(&envelope, &source).unwrap(), b"payload");
    }

    #[test]
    fn password_envelopes_use_fresh_salt() {
        let source = KeySource::password("hunter2");
        let a = seal(b"same", &source);
        let b = seal(b"same", &source);
        assert_ne!(a[16..16 + SALT_LEN], b[16..16 + SALT_LEN]);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let source = keystore_source();
        assert!(open(&seal(b"", &source), &source).unwrap().is_empty());
    }

    #[test]
    fn multi_segment_roundtrip() {
        let source = keystore_source();
        for len in [SEGMENT_LEN - 1, SEGMENT_LEN, SEGMENT_LEN + 1, 3 * SEGMENT_LEN + 17] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            assert_eq!(open(&seal(&data, &source), &source).unwrap(), data, "len {len}");
        }
    }

    // -----------------------------------------------------------------------
    // Tamper rejection
    // -----------------------------------------------------------------------

    #[test]
    fn bad_magic_rejected() {
        let source = keystore_source();
        let mut envelope = seal(b"data", &source);
        envelope[0] = b'X';
        assert!(matches!(open(&envelope, &source), Err(CryptoError::InvalidMagic { .. })));
    }

    #[test]
    fn bad_version_rejected() {
        let source = keystore_source();
        let mut envelope = seal(b"data", &source);
        envelope[10] = 2;
        assert!(matches!(open(&envelope, &source), Err(CryptoError::UnsupportedVersion(2))));
    }

    #[test]
    fn oversized_salt_length_rejected() {
        let source = KeySource::password("pw");
        let mut envelope = seal(b"data", &source);
        envelope[12..16].copy_from_slice(&2000u32.to_be_bytes());
        let err = open(&envelope, &source).unwrap_err();
        assert!(matches!(err, CryptoError::FieldLength { field: "salt", length: 2000, .. }));
        assert!(err.is_format_error());
    }

    #[test]
    fn oversized_iv_length_rejected() {
        let source = keystore_source();
        let mut envelope = seal(b"data", &source);
        envelope[12..16].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(open(&envelope, &source), Err(CryptoError::FieldLength { field: "IV", .. })));
    }

    #[test]
    fn key_source_mismatch_rejected() {
        let keystore = keystore_source();
        let password = KeySource::password("pw");
        let err = open(&seal(b"data", &keystore), &password).unwrap_err();
        assert!(matches!(err, CryptoError::KeySourceMismatch { expected: "password", found: "keystore" }));
        let err = open(&seal(b"data", &password), &keystore).unwrap_err();
        assert!(matches!(err, CryptoError::KeySourceMismatch { expected: "keystore", found: "password" }));
    }

    #[test]
    fn flipped_payload_bit_fails_authentication() {
        let source = keystore_source();
        let mut envelope = seal(b"sensitive data", &source);
        let last = envelope.len() - 1;
        envelope[last] ^= 0x01;
        assert!(matches!(open(&envelope, &source), Err(CryptoError::Authentication)));
    }

    #[test]
    fn wrong_password_fails_authentication() {
        let envelope = seal(b"data", &KeySource::password("right"));
        assert!(matches!(
            open(&envelope, &KeySource::password("wrong")),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn truncated_segment_fails_authentication() {
        let source = keystore_source();
        let data = vec![9u8; SEGMENT_LEN * 2];
        let envelope = seal(&data, &source);
        // Cut right after the first full segment: the reader must not accept
        // a middle segment as the last one.
        let header_len = 16 + IV_LEN;
        let cut = &envelope[..header_len + CIPHER_SEGMENT_LEN];
        assert!(matches!(open(cut, &source), Err(CryptoError::Authentication)));
    }

    #[test]
    fn truncated_header_reported() {
        let source = keystore_source();
        assert!(matches!(open(b"NUXEO", &source), Err(CryptoError::Truncated("magic"))));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]
        #[test]
        fn roundtrip_any_payload(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let source = keystore_source();
            prop_assert_eq!(open(&seal(&data, &source), &source).unwrap(), data);
        }
    }
}
