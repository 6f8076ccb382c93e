//! Confirm an encrypted artifact decrypts to its source.

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use anyhow::Context;
use sha2::{Digest, Sha256};
use veil::cipher::StreamCipher;

/// Digest comparison between a source module and its encrypted form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Hex SHA-256 of the plaintext source.
    pub source_sha256: String,
    /// Hex SHA-256 of the decrypted artifact.
    pub decrypted_sha256: String,
    /// Plaintext length recovered from the artifact.
    pub decrypted_len: u64,
}

impl VerifyReport {
    /// Whether both digests agree.
    pub fn matches(&self) -> bool {
        self.source_sha256 == self.decrypted_sha256
    }
}

/// `Write` sink feeding a SHA-256 hasher.
struct HashWriter(Sha256);

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Hex SHA-256 of everything `reader` yields.
///
/// # Errors
///
/// Returns an error if reading fails.
pub fn sha256_hex(reader: impl Read) -> io::Result<String> {
    let mut hasher = HashWriter(Sha256::new());
    io::copy(&mut BufReader::new(reader), &mut hasher)?;
    Ok(hex::encode(hasher.0.finalize()))
}

/// Stream-decrypt `encrypted` and compare the plaintext
/// digest against `source`.
///
/// # Errors
///
/// Returns an error if either file cannot be read or the artifact does not
/// decrypt. A digest mismatch is reported through [`VerifyReport::matches`].
pub fn verify(cipher: &StreamCipher, source: &Path, encrypted: &Path) -> anyhow::Result<VerifyReport> {
    let source_file =
        fs::File::open(source).with_context(|| format!("failed to open {}", source.display()))?;
    let source_sha256 = sha256_hex(source_file)
        .with_context(|| format!("failed to hash {}", source.display()))?;

    let encrypted_file = fs::File::open(encrypted)
        .with_context(|| format!("failed to open {}", encrypted.display()))?;
    let mut hasher = HashWriter(Sha256::new());
    let decrypted_len = cipher
        .decrypt(BufReader::new(encrypted_file), &mut hasher)
        .with_context(|| format!("failed to decrypt {}", encrypted.display()))?;

    Ok(VerifyReport {
        source_sha256,
        decrypted_sha256: hex::encode(hasher.0.finalize()),
        decrypted_len,
    })
}
