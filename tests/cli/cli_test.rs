//! `veil stage`, `veil run` and `veil clear` against a temporary home.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use veil::cipher::{CipherMode, KeyMaterial, StreamCipher};

const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";
const IV_HEX: &str = "0f0e0d0c0b0a09080706050403020100";
const PLUGIN_WAT: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/demos/plugin.wat"));

/// Lay out `~/.veil/veil.toml` and an encrypted demo artifact under `home`.
fn provision(home: &Path) -> PathBuf {
    let source = home.join("assets").join("plugin_v1.dat");
    fs::create_dir_all(source.parent().expect("parent")).expect("mkdir");
    let cipher = StreamCipher::new(
        KeyMaterial::from_hex(KEY_HEX, IV_HEX).expect("hex"),
        CipherMode::Cbc,
    );
    let mut ciphertext = Vec::new();
    cipher
        .encrypt(PLUGIN_WAT.as_bytes(), &mut ciphertext)
        .expect("encrypt");
    fs::write(&source, ciphertext).expect("write artifact");

    let root = home.join(".veil");
    fs::create_dir_all(&root).expect("mkdir");
    fs::write(
        root.join("veil.toml"),
        format!(
            "[artifact]\nsource = {:?}\nentry = \"plugin\"\n",
            source.display().to_string()
        ),
    )
    .expect("write config");
    root.join("cache").join("plugin.wasm")
}

fn veil(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("veil").expect("binary built");
    cmd.env("HOME", home)
        .env("VEIL_KEY", KEY_HEX)
        .env("VEIL_IV", IV_HEX)
        .env_remove("VEIL_CONFIG")
        .env_remove("VEIL_ARTIFACT_SOURCE")
        .env_remove("VEIL_ENTRY")
        .env_remove("VEIL_CIPHER_MODE")
        .env_remove("VEIL_CACHE_DIR");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).expect("utf8 stdout")
}

#[test]
fn stage_then_stage_again_reports_cache_hit() {
    let home = tempfile::tempdir().expect("tempdir");
    let staged = provision(home.path());

    let first = stdout_of(veil(home.path()).arg("stage"));
    assert!(first.starts_with("staged "), "{first}");
    assert_eq!(fs::read(&staged).expect("read"), PLUGIN_WAT.as_bytes());

    let second = stdout_of(veil(home.path()).arg("stage"));
    assert!(second.starts_with("already staged"), "{second}");
}

#[test]
fn run_drives_full_lifecycle_with_veto() {
    let home = tempfile::tempdir().expect("tempdir");
    provision(home.path());

    let out = stdout_of(
        veil(home.path()).args(["run", "--param", "token=abc", "--param", "url=https://example.invalid"]),
    );
    assert!(out.contains("state=destroyed"), "{out}");
    assert!(out.contains("back_allowed=false"), "{out}");
}

#[test]
fn run_without_artifact_degrades_instead_of_failing() {
    let home = tempfile::tempdir().expect("tempdir");
    provision(home.path());
    fs::remove_file(home.path().join("assets").join("plugin_v1.dat")).expect("remove");

    let out = stdout_of(veil(home.path()).arg("run"));
    assert!(out.contains("state=unattached"), "{out}");
    assert!(out.contains("back_allowed=true"), "{out}");
}

#[test]
fn clear_removes_staged_artifact() {
    let home = tempfile::tempdir().expect("tempdir");
    let staged = provision(home.path());
    veil(home.path()).arg("stage").assert().success();
    assert!(staged.exists());

    let out = stdout_of(veil(home.path()).arg("clear"));
    assert!(out.starts_with("removed"), "{out}");
    assert!(!staged.exists());

    let again = stdout_of(veil(home.path()).arg("clear"));
    assert!(again.starts_with("nothing staged"), "{again}");
}

#[test]
fn malformed_param_is_rejected() {
    let home = tempfile::tempdir().expect("tempdir");
    provision(home.path());
    veil(home.path())
        .args(["run", "--param", "no-equals-sign"])
        .assert()
        .failure();
}
