//! Materialise the decrypted artifact in the private cache, once.
//!
//! The first call decrypts the encrypted resource into a temporary file next
//! to the destination, locks its permissions down, and renames it into place
//! without clobbering. Later calls find the destination and return at once
//! without touching the source. A failed attempt leaves nothing behind, so the
//! next launch starts clean.

use std::borrow::Cow;
use std::fs;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::cipher::{CipherError, StreamCipher};

/// Final Unix mode of a staged artifact: owner read-only.
pub const STAGED_MODE: u32 = 0o400;

/// Prefix of in-flight temporary files inside the cache directory.
const TEMP_PREFIX: &str = ".veil-staging-";

/// Errors produced while staging an artifact.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// The encrypted resource could not be opened.
    #[error("failed to open artifact source {name}: {source}")]
    Source {
        /// Source description.
        name: String,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Decryption failed part-way; the partial output was discarded.
    #[error("failed to decrypt artifact source {name}: {source}")]
    Decrypt {
        /// Source description.
        name: String,
        /// Underlying cipher error.
        source: CipherError,
    },
    /// Directory creation, write, or rename failed.
    #[error("staging I/O failed at {}: {source}", .path.display())]
    Io {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The staged file could not be made read-only.
    #[error("failed to lock down permissions on {}: {source}", .path.display())]
    Permissions {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// An encrypted, read-only artifact shipped with the host.
pub trait ArtifactSource {
    /// Human-readable name used in logs and errors.
    fn name(&self) -> &str;

    /// Open a fresh reader over the encrypted bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the resource cannot be opened.
    fn open(&self) -> io::Result<Box<dyn Read + '_>>;
}

/// Encrypted artifact stored as a file next to the host.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    /// Point at an encrypted artifact file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self { path, name }
    }

    /// Path of the encrypted file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArtifactSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        let file = fs::File::open(&self.path)?;
        Ok(Box::new(file))
    }
}

/// Encrypted artifact compiled into the host binary (e.g. via `include_bytes!`).
#[derive(Debug, Clone)]
pub struct EmbeddedSource {
    name: String,
    bytes: Cow<'static, [u8]>,
}

impl EmbeddedSource {
    /// Wrap embedded ciphertext under a resource name.
    pub fn new(name: impl Into<String>, bytes: impl Into<Cow<'static, [u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

impl ArtifactSource for EmbeddedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(self.bytes.as_ref()))
    }
}

/// Outcome of a successful [`ArtifactStager::stage`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged {
    /// The artifact was decrypted during this call.
    Fresh {
        /// Plaintext bytes written.
        bytes: u64,
    },
    /// The destination already existed; the source was not read.
    Cached,
}

/// Decrypts an encrypted artifact into a fixed destination exactly once.
#[derive(Debug, Clone)]
pub struct ArtifactStager {
    cipher: StreamCipher,
}

impl ArtifactStager {
    /// Create a stager using the given transform.
    pub fn new(cipher: StreamCipher) -> Self {
        Self { cipher }
    }

    /// Stage `source` at `destination` unless it is already there.
    ///
    /// Safe against concurrent first runs on the same destination: the
    /// decrypted file appears through an atomic no-clobber rename, and a
    /// caller that loses the race reports [`Staged::Cached`].
    ///
    /// # Errors
    ///
    /// Returns a [`StagingError`] if the source cannot be opened or decrypted,
    /// or if the file cannot be written, locked down, or moved into place. No
    /// partial file survives a failure.
    pub fn stage(
        &self,
        source: &dyn ArtifactSource,
        destination: &Path,
    ) -> Result<Staged, StagingError> {
        if destination.exists() {
            debug!(path = %destination.display(), "staged artifact present, skipping decrypt");
            return Ok(Staged::Cached);
        }

        let parent = match destination.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| StagingError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;

        // Dropping the temp file on any early return deletes the partial output.
        let mut staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)
            .map_err(|e| StagingError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;

        let reader = source.open().map_err(|e| StagingError::Source {
            name: source.name().to_owned(),
            source: e,
        })?;

        let bytes = self
            .cipher
            .decrypt(BufReader::new(reader), BufWriter::new(staging.as_file_mut()))
            .map_err(|e| StagingError::Decrypt {
                name: source.name().to_owned(),
                source: e,
            })?;

        staging.as_file().sync_all().map_err(|e| StagingError::Io {
            path: staging.path().to_path_buf(),
            source: e,
        })?;

        lock_down(staging.path()).map_err(|e| StagingError::Permissions {
            path: staging.path().to_path_buf(),
            source: e,
        })?;

        match staging.persist_noclobber(destination) {
            Ok(_) => {
                info!(
                    source = %source.name(),
                    path = %destination.display(),
                    bytes,
                    mode = %self.cipher.mode(),
                    "artifact staged"
                );
                Ok(Staged::Fresh { bytes })
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %destination.display(), "another stager finished first");
                Ok(Staged::Cached)
            }
            Err(e) => Err(StagingError::Io {
                path: destination.to_path_buf(),
                source: e.error,
            }),
        }
    }
}

/// Remove a staged artifact so the next launch decrypts it again.
///
/// Returns `true` if a file was removed, `false` if none was present.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be removed.
pub fn clear(destination: &Path) -> Result<bool, StagingError> {
    if !destination.exists() {
        return Ok(false);
    }

    #[cfg(not(unix))]
    {
        if let Ok(meta) = fs::metadata(destination) {
            let mut perms = meta.permissions();
            perms.set_readonly(false);
            if let Err(e) = fs::set_permissions(destination, perms) {
                warn!(path = %destination.display(), error = %e, "failed to clear read-only flag");
            }
        }
    }

    match fs::remove_file(destination) {
        Ok(()) => {
            info!(path = %destination.display(), "staged artifact cleared");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(path = %destination.display(), error = %e, "failed to clear staged artifact");
            Err(StagingError::Io {
                path: destination.to_path_buf(),
                source: e,
            })
        }
    }
}

/// Make a file readable, non-writable and non-executable.
fn lock_down(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(path, fs::Permissions::from_mode(STAGED_MODE))
    }

    #[cfg(not(unix))]
    {
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms)
    }
}
