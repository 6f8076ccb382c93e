//! Encrypt and decrypt whole files through a [`StreamCipher`].
//!
//! Output is written to a temporary file beside the destination and renamed
//! into place, so a failed run never leaves a truncated artifact.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use tracing::info;
use veil::cipher::StreamCipher;

/// Direction of a pack operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Plaintext to ciphertext.
    Encrypt,
    /// Ciphertext to plaintext.
    Decrypt,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
        }
    }
}

/// Encrypt `input` into `output`, creating the output's parent directory.
///
/// Returns the number of ciphertext bytes written.
///
/// # Errors
///
/// Returns an error if either file cannot be accessed or the transform fails.
pub fn encrypt_file(cipher: &StreamCipher, input: &Path, output: &Path) -> anyhow::Result<u64> {
    transform_file(cipher, Direction::Encrypt, input, output)
}

/// Decrypt `input` into `output`, creating the output's parent directory.
///
/// Returns the number of plaintext bytes produced.
///
/// # Errors
///
/// Returns an error if either file cannot be accessed or the ciphertext is
/// rejected.
pub fn decrypt_file(cipher: &StreamCipher, input: &Path, output: &Path) -> anyhow::Result<u64> {
    transform_file(cipher, Direction::Decrypt, input, output)
}

fn transform_file(
    cipher: &StreamCipher,
    direction: Direction,
    input: &Path,
    output: &Path,
) -> anyhow::Result<u64> {
    let reader = fs::File::open(input)
        .with_context(|| format!("failed to open {}", input.display()))?;

    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut staging = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;

    let bytes = {
        let mut writer = BufWriter::new(staging.as_file_mut());
        let bytes = match direction {
            Direction::Encrypt => cipher.encrypt(BufReader::new(reader), &mut writer),
            Direction::Decrypt => cipher.decrypt(BufReader::new(reader), &mut writer),
        }
        .with_context(|| format!("failed to {} {}", direction.as_str(), input.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush output for {}", output.display()))?;
        bytes
    };

    staging
        .persist(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    info!(
        direction = direction.as_str(),
        input = %input.display(),
        output = %output.display(),
        bytes,
        mode = %cipher.mode(),
        "artifact transformed"
    );
    Ok(bytes)
}
