//! Key material loading from the environment or a private key file.
//!
//! The env vars named in `[cipher]` win. When either is unset, both values
//! are read from `~/.veil/keys.env`, which must not be readable by group or
//! others.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, info};

use crate::cipher::KeyMaterial;
use crate::config::CipherConfig;

/// Resolve key material using the process environment.
///
/// # Errors
///
/// Returns an error if neither the environment nor the key file provides
/// both values, or if a value is not 16 bytes of hex.
pub fn load_key_material(cipher: &CipherConfig, keys_file: &Path) -> anyhow::Result<KeyMaterial> {
    load_key_material_with(cipher, keys_file, |key| std::env::var(key).ok())
}

/// [`load_key_material`] with a custom env resolver.
///
/// # Errors
///
/// Same as [`load_key_material`].
pub fn load_key_material_with(
    cipher: &CipherConfig,
    keys_file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<KeyMaterial> {
    if let (Some(key), Some(iv)) = (env(&cipher.key_env), env(&cipher.iv_env)) {
        debug!(key_env = %cipher.key_env, iv_env = %cipher.iv_env, "key material from environment");
        return KeyMaterial::from_hex(&key, &iv)
            .with_context(|| format!("invalid key material in ${} / ${}", cipher.key_env, cipher.iv_env));
    }

    let vars = read_keys_file(keys_file)?;
    let key = vars.get(&cipher.key_env).ok_or_else(|| {
        anyhow::anyhow!("{} missing from {}", cipher.key_env, keys_file.display())
    })?;
    let iv = vars.get(&cipher.iv_env).ok_or_else(|| {
        anyhow::anyhow!("{} missing from {}", cipher.iv_env, keys_file.display())
    })?;
    debug!(path = %keys_file.display(), "key material from key file");
    KeyMaterial::from_hex(key, iv)
        .with_context(|| format!("invalid key material in {}", keys_file.display()))
}

fn read_keys_file(path: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "no key material in the environment and key file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read key file at {}", path.display()))?;
    for item in iter {
        let (key, value) = item.with_context(|| {
            format!("failed to parse key-value entry in key file {}", path.display())
        })?;
        vars.insert(key, value);
    }
    Ok(vars)
}

/// Generate fresh random key material.
///
/// # Errors
///
/// Returns an error if the generated key or IV is rejected by
/// [`KeyMaterial::from_slices`]; both are drawn at the required 16 bytes.
pub fn generate_key_material() -> anyhow::Result<KeyMaterial> {
    let key: [u8; 16] = rand::random();
    let iv: [u8; 16] = rand::random();
    KeyMaterial::from_slices(&key, &iv).context("generated key material has wrong length")
}

/// Write `material` to a new key file with `0600` permissions.
///
/// # Errors
///
/// Returns an error if the file already exists or cannot be written.
pub fn write_keys_file(
    path: &Path,
    cipher: &CipherConfig,
    material: &KeyMaterial,
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("refusing to overwrite key file {}", path.display()))?;
    enforce_private_file_permissions(path)?;

    let (key, iv) = material.expose_hex();
    writeln!(file, "{}={key}", cipher.key_env)
        .and_then(|()| writeln!(file, "{}={iv}", cipher.iv_env))
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    info!(path = %path.display(), "key file written");
    Ok(())
}

/// Restrict a file to owner read/write when supported.
///
/// # Errors
///
/// Returns an error if permissions cannot be updated.
pub fn enforce_private_file_permissions(path: &Path) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect key file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "key file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}
