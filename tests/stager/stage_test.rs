//! Staging outcomes, cache hits and failure cleanup.

use std::cell::Cell;
use std::fs;
use std::io::{self, Read};
use std::path::Path;

use veil::cipher::{CipherMode, KeyMaterial, StreamCipher};
use veil::stager::{clear, ArtifactSource, ArtifactStager, EmbeddedSource, FileSource, Staged, StagingError};

fn cipher(mode: CipherMode) -> StreamCipher {
    StreamCipher::new(
        KeyMaterial::from_slices(&[0x11; 16], &[0x22; 16]).expect("key"),
        mode,
    )
}

fn encrypt(mode: CipherMode, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    cipher(mode).encrypt(data, &mut out).expect("encrypt");
    out
}

/// Source that counts how often it is opened.
struct CountingSource {
    inner: EmbeddedSource,
    opens: Cell<u32>,
}

impl ArtifactSource for CountingSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        self.opens.set(self.opens.get().saturating_add(1));
        self.inner.open()
    }
}

/// Source that yields some bytes and then fails.
struct FailingSource;

impl ArtifactSource for FailingSource {
    fn name(&self) -> &str {
        "failing"
    }

    fn open(&self) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new((&[0u8; 32][..]).chain(BrokenReader)))
    }
}

struct BrokenReader;

impl Read for BrokenReader {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "device went away"))
    }
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read_dir")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn second_stage_is_a_cache_hit_that_never_opens_the_source() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");
    let source = CountingSource {
        inner: EmbeddedSource::new("plugin_v1.dat", encrypt(CipherMode::Cbc, b"module body")),
        opens: Cell::new(0),
    };
    let stager = ArtifactStager::new(cipher(CipherMode::Cbc));

    assert_eq!(
        stager.stage(&source, &dest).expect("first"),
        Staged::Fresh { bytes: 11 }
    );
    let first = fs::read(&dest).expect("read");

    assert_eq!(stager.stage(&source, &dest).expect("second"), Staged::Cached);
    assert_eq!(source.opens.get(), 1);
    assert_eq!(fs::read(&dest).expect("read"), first);
}

#[test]
fn undecryptable_source_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");
    let mut bytes = encrypt(CipherMode::Cbc, &[7u8; 100]);
    bytes.truncate(bytes.len().saturating_sub(3));

    let err = ArtifactStager::new(cipher(CipherMode::Cbc))
        .stage(&EmbeddedSource::new("plugin_v1.dat", bytes), &dest)
        .expect_err("truncated");
    assert!(matches!(err, StagingError::Decrypt { .. }));
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn read_failure_mid_stream_leaves_nothing_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");

    let err = ArtifactStager::new(cipher(CipherMode::Cbc))
        .stage(&FailingSource, &dest)
        .expect_err("broken source");
    assert!(matches!(err, StagingError::Decrypt { .. }));
    assert!(entries(dir.path()).is_empty());
}

#[test]
fn missing_source_file_is_a_source_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = ArtifactStager::new(cipher(CipherMode::Cbc))
        .stage(
            &FileSource::new(dir.path().join("absent.dat")),
            &dir.path().join("plugin.wasm"),
        )
        .expect_err("absent");
    assert!(matches!(err, StagingError::Source { .. }));
}

#[test]
fn tampered_sealed_source_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");
    let mut bytes = encrypt(CipherMode::Sealed, &[9u8; 500]);
    let last = bytes.len().saturating_sub(1);
    bytes[last] ^= 0x80;

    let err = ArtifactStager::new(cipher(CipherMode::Sealed))
        .stage(&EmbeddedSource::new("plugin_v1.dat", bytes), &dest)
        .expect_err("tampered");
    assert!(matches!(err, StagingError::Decrypt { .. }));
    assert!(!dest.exists());
}

#[cfg(unix)]
#[test]
fn staged_file_is_read_only_and_not_executable() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");
    ArtifactStager::new(cipher(CipherMode::Cbc))
        .stage(
            &EmbeddedSource::new("plugin_v1.dat", encrypt(CipherMode::Cbc, b"x")),
            &dest,
        )
        .expect("stage");

    let mode = fs::metadata(&dest).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode & 0o222, 0, "no write bits");
    assert_eq!(mode & 0o111, 0, "no execute bits");
    assert_eq!(mode & 0o077, 0, "owner only");
}

#[test]
fn clear_forces_a_fresh_stage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("plugin.wasm");
    let stager = ArtifactStager::new(cipher(CipherMode::Cbc));
    let source = EmbeddedSource::new("plugin_v1.dat", encrypt(CipherMode::Cbc, b"abc"));

    stager.stage(&source, &dest).expect("stage");
    assert!(clear(&dest).expect("clear"));
    assert!(!dest.exists());
    assert!(!clear(&dest).expect("clear again"));
    assert_eq!(
        stager.stage(&source, &dest).expect("restage"),
        Staged::Fresh { bytes: 3 }
    );
}
