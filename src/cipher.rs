//! Streaming symmetric transform for encrypted artifacts.
//!
//! Two wire formats:
//! - **CBC** ([`CipherMode::Cbc`]): AES-128-CBC with PKCS#7 padding, the format
//!   produced by the legacy packer. Hides content but carries no integrity
//!   tag: a flipped bit decrypts to garbage or to a padding error, and a
//!   ciphertext cut on a block boundary decrypts cleanly whenever the new
//!   last block happens to end in valid padding. Only a partial trailing
//!   block is reported as truncation.
//! - **Sealed** ([`CipherMode::Sealed`]): chunked XChaCha20-Poly1305 keyed by
//!   HKDF over the same key material. Every segment is authenticated and the
//!   final one is flagged, so truncation and tampering are always rejected.
//!
//! Both directions read input in bounded chunks; a payload is never held in
//! memory as a whole.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::debug;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;

/// CBC initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Read buffer for the CBC transform.
const READ_CHUNK: usize = 4096;

const SEALED_MAGIC: &[u8; 8] = b"VEILSEAL";
const SEALED_INFO: &[u8] = b"veil/sealed/v1";
const NONCE_PREFIX_LEN: usize = 19;
/// Magic plus nonce prefix.
const HEADER_LEN: usize = 27;
const TAG_LEN: usize = 16;

/// Plaintext bytes per sealed segment.
pub const SEGMENT_LEN: usize = 65_536;

/// Errors produced by the cipher transform.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    /// Key or IV does not match the algorithm's required size.
    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Which parameter was wrong ("key" or "iv").
        what: &'static str,
        /// Required length in bytes.
        expected: usize,
        /// Length that was supplied.
        actual: usize,
    },
    /// Key material was not valid hex.
    #[error("invalid {what} encoding: {reason}")]
    Encoding {
        /// Which parameter was wrong ("key" or "iv").
        what: &'static str,
        /// Decoder diagnostics.
        reason: String,
    },
    /// Unrecognised cipher mode name.
    #[error("unknown cipher mode: {0:?} (expected \"cbc\" or \"sealed\")")]
    UnknownMode(String),
    /// Ciphertext ended early or is not a whole number of blocks.
    #[error("ciphertext truncated after {len} bytes")]
    Truncated {
        /// Number of ciphertext bytes consumed before the stream ended.
        len: u64,
    },
    /// The final CBC block does not carry valid PKCS#7 padding.
    #[error("ciphertext padding is malformed")]
    BadPadding,
    /// Stream does not start with the sealed header magic.
    #[error("not a sealed artifact: header magic mismatch")]
    Format,
    /// A sealed segment failed tag verification.
    #[error("sealed segment {segment} failed authentication")]
    Authentication {
        /// Zero-based segment index.
        segment: u32,
    },
    /// Payload exceeds the segment counter range of the sealed format.
    #[error("payload too large for the sealed format")]
    TooLarge,
    /// Underlying read or write failed.
    #[error("cipher stream I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Symmetric key plus initialization vector.
///
/// Immutable once built. `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

impl KeyMaterial {
    /// Build key material from raw byte slices.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidKeyLength`] if either slice is not
    /// exactly 16 bytes.
    pub fn from_slices(key: &[u8], iv: &[u8]) -> Result<Self, CipherError> {
        let key = <[u8; KEY_LEN]>::try_from(key).map_err(|_| CipherError::InvalidKeyLength {
            what: "key",
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        let iv = <[u8; IV_LEN]>::try_from(iv).map_err(|_| CipherError::InvalidKeyLength {
            what: "iv",
            expected: IV_LEN,
            actual: iv.len(),
        })?;
        Ok(Self { key, iv })
    }

    /// Build key material from hex strings (surrounding whitespace ignored).
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Encoding`] for invalid hex and
    /// [`CipherError::InvalidKeyLength`] for wrong decoded lengths.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, CipherError> {
        let key = hex::decode(key_hex.trim()).map_err(|e| CipherError::Encoding {
            what: "key",
            reason: e.to_string(),
        })?;
        let iv = hex::decode(iv_hex.trim()).map_err(|e| CipherError::Encoding {
            what: "iv",
            reason: e.to_string(),
        })?;
        Self::from_slices(&key, &iv)
    }

    /// Hex-encode key and IV, for writing a private key file.
    pub fn expose_hex(&self) -> (String, String) {
        (hex::encode(self.key), hex::encode(self.iv))
    }
}

/// Artifact wire format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherMode {
    /// AES-128-CBC with PKCS#7 padding, unauthenticated.
    #[default]
    Cbc,
    /// Chunked XChaCha20-Poly1305, authenticated.
    Sealed,
}

impl CipherMode {
    /// Return the configuration name of this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cbc => "cbc",
            Self::Sealed => "sealed",
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherMode {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cbc" => Ok(Self::Cbc),
            "sealed" => Ok(Self::Sealed),
            other => Err(CipherError::UnknownMode(other.to_owned())),
        }
    }
}

/// Streaming encrypt/decrypt over `Read`/`Write` pairs.
#[derive(Debug, Clone)]
pub struct StreamCipher {
    key: KeyMaterial,
    mode: CipherMode,
}

impl StreamCipher {
    /// Create a transform for the given key material and wire format.
    pub fn new(key: KeyMaterial, mode: CipherMode) -> Self {
        Self { key, mode }
    }

    /// Wire format used by this transform.
    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    /// Encrypt `input` into `output`, returning the number of bytes written.
    ///
    /// Succeeds for any finite input; CBC output is padded to the block size.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Io`] if reading or writing fails.
    pub fn encrypt<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64, CipherError> {
        let written = match self.mode {
            CipherMode::Cbc => self.cbc_encrypt(input, output)?,
            CipherMode::Sealed => self.sealed_encrypt(input, output)?,
        };
        debug!(mode = %self.mode, bytes = written, "encrypted stream");
        Ok(written)
    }

    /// Decrypt `input` into `output`, returning the number of plaintext bytes.
    ///
    /// Bytes may already have been written to `output` when an error is
    /// returned; callers discard the partial output.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Truncated`] or [`CipherError::BadPadding`] for
    /// malformed CBC data, [`CipherError::Format`] or
    /// [`CipherError::Authentication`] for rejected sealed data, and
    /// [`CipherError::Io`] if reading or writing fails.
    pub fn decrypt<R: Read, W: Write>(&self, input: R, output: W) -> Result<u64, CipherError> {
        let written = match self.mode {
            CipherMode::Cbc => self.cbc_decrypt(input, output)?,
            CipherMode::Sealed => self.sealed_decrypt(input, output)?,
        };
        debug!(mode = %self.mode, bytes = written, "decrypted stream");
        Ok(written)
    }

    // -- CBC --

    fn cbc_encrypt<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64, CipherError> {
        let mut encryptor = Aes128CbcEnc::new(&self.key.key.into(), &self.key.iv.into());
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK.saturating_add(BLOCK_SIZE));
        let mut written: u64 = 0;

        loop {
            let n = read_full(&mut input, &mut chunk)?;
            if n == 0 {
                break;
            }
            pending.extend_from_slice(&chunk[..n]);

            let ready = pending.len().saturating_sub(pending.len() % BLOCK_SIZE);
            if ready > 0 {
                for block in pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
                    encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                output.write_all(&pending[..ready])?;
                written = written.saturating_add(byte_count(ready));
                pending.drain(..ready);
            }
        }

        let mut tail = [0u8; BLOCK_SIZE];
        tail[..pending.len()].copy_from_slice(&pending);
        let last = encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut tail, pending.len())
            .map_err(|_| CipherError::BadPadding)?;
        output.write_all(last)?;
        output.flush()?;
        Ok(written.saturating_add(byte_count(last.len())))
    }

    fn cbc_decrypt<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64, CipherError> {
        let mut decryptor = Aes128CbcDec::new(&self.key.key.into(), &self.key.iv.into());
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK.saturating_add(BLOCK_SIZE));
        let mut consumed: u64 = 0;
        let mut written: u64 = 0;

        loop {
            let n = read_full(&mut input, &mut chunk)?;
            if n == 0 {
                break;
            }
            consumed = consumed.saturating_add(byte_count(n));
            pending.extend_from_slice(&chunk[..n]);

            // The last whole block stays pending: its padding is checked at EOF.
            let ready = held_back_boundary(pending.len());
            if ready > 0 {
                for block in pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
                    decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
                }
                output.write_all(&pending[..ready])?;
                written = written.saturating_add(byte_count(ready));
                pending.drain(..ready);
            }
        }

        if pending.len() != BLOCK_SIZE {
            return Err(CipherError::Truncated { len: consumed });
        }

        let last = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut pending)
            .map_err(|_| CipherError::BadPadding)?;
        output.write_all(last)?;
        output.flush()?;
        Ok(written.saturating_add(byte_count(last.len())))
    }

    // -- Sealed --

    fn sealed_aead(&self) -> Result<XChaCha20Poly1305, CipherError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.key.iv[..]), &self.key.key);
        let mut okm = [0u8; 32];
        hk.expand(SEALED_INFO, &mut okm)
            .map_err(|_| CipherError::InvalidKeyLength {
                what: "derived key",
                expected: 32,
                actual: okm.len(),
            })?;
        Ok(XChaCha20Poly1305::new(Key::from_slice(&okm)))
    }

    fn sealed_encrypt<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64, CipherError> {
        let aead = self.sealed_aead()?;

        let generated = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&generated[..NONCE_PREFIX_LEN]);

        let mut header = [0u8; HEADER_LEN];
        header[..SEALED_MAGIC.len()].copy_from_slice(SEALED_MAGIC);
        header[SEALED_MAGIC.len()..].copy_from_slice(&prefix);
        output.write_all(&header)?;
        let mut written = byte_count(HEADER_LEN);

        let mut current = vec![0u8; SEGMENT_LEN];
        let mut next = vec![0u8; SEGMENT_LEN];
        let mut current_len = read_full(&mut input, &mut current)?;
        let mut segment: u32 = 0;

        loop {
            let next_len = if current_len == SEGMENT_LEN {
                read_full(&mut input, &mut next)?
            } else {
                0
            };
            let last = next_len == 0;

            let sealed = aead
                .encrypt(
                    &segment_nonce(&prefix, segment, last),
                    Payload {
                        msg: &current[..current_len],
                        aad: &header,
                    },
                )
                .map_err(|_| CipherError::Authentication { segment })?;
            output.write_all(&sealed)?;
            written = written.saturating_add(byte_count(sealed.len()));

            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            segment = segment.checked_add(1).ok_or(CipherError::TooLarge)?;
        }

        output.flush()?;
        Ok(written)
    }

    fn sealed_decrypt<R: Read, W: Write>(&self, mut input: R, mut output: W) -> Result<u64, CipherError> {
        let aead = self.sealed_aead()?;

        let mut header = [0u8; HEADER_LEN];
        let header_len = read_full(&mut input, &mut header)?;
        if header_len < HEADER_LEN {
            return Err(CipherError::Truncated {
                len: byte_count(header_len),
            });
        }
        if &header[..SEALED_MAGIC.len()] != SEALED_MAGIC {
            return Err(CipherError::Format);
        }
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&header[SEALED_MAGIC.len()..]);

        let sealed_len = SEGMENT_LEN.saturating_add(TAG_LEN);
        let mut current = vec![0u8; sealed_len];
        let mut next = vec![0u8; sealed_len];
        let mut current_len = read_full(&mut input, &mut current)?;
        let mut consumed = byte_count(HEADER_LEN).saturating_add(byte_count(current_len));
        let mut segment: u32 = 0;
        let mut written: u64 = 0;

        loop {
            if current_len < TAG_LEN {
                return Err(CipherError::Truncated { len: consumed });
            }
            let next_len = if current_len == sealed_len {
                read_full(&mut input, &mut next)?
            } else {
                0
            };
            consumed = consumed.saturating_add(byte_count(next_len));
            let last = next_len == 0;

            let plain = aead
                .decrypt(
                    &segment_nonce(&prefix, segment, last),
                    Payload {
                        msg: &current[..current_len],
                        aad: &header,
                    },
                )
                .map_err(|_| CipherError::Authentication { segment })?;
            output.write_all(&plain)?;
            written = written.saturating_add(byte_count(plain.len()));

            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            segment = segment.checked_add(1).ok_or(CipherError::TooLarge)?;
        }

        output.flush()?;
        Ok(written)
    }
}

/// Largest block-aligned length strictly below `len`, keeping one whole
/// block (or the unaligned remainder) pending.
fn held_back_boundary(len: usize) -> usize {
    match len.checked_sub(1) {
        Some(below) => below.saturating_sub(below % BLOCK_SIZE),
        None => 0,
    }
}

fn segment_nonce(prefix: &[u8; NONCE_PREFIX_LEN], segment: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..23].copy_from_slice(&segment.to_be_bytes());
    nonce[23] = u8::from(last);
    XNonce::from(nonce)
}

fn byte_count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Fill `buf` from `reader` until it is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled = filled.saturating_add(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
