//! Configuration loading and runtime path resolution.
//!
//! Loads `veil.toml` from `$VEIL_CONFIG` or `~/.veil/veil.toml`. Environment
//! variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cipher::CipherMode;

/// Name of the per-user runtime directory under `$HOME`.
const RUNTIME_DIR: &str = ".veil";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    /// Encrypted artifact and entry point (`[artifact]`).
    pub artifact: ArtifactConfig,
    /// Transform mode and key sources (`[cipher]`).
    pub cipher: CipherConfig,
    /// Directory overrides (`[paths]`).
    pub paths: PathsConfig,
}

impl VeilConfig {
    /// Load configuration with precedence env vars > TOML file > defaults.
    ///
    /// A missing config file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the merged configuration is invalid.
    pub fn load(paths: &RuntimePaths) -> Result<Self> {
        Self::load_with(paths, |key| std::env::var(key).ok())
    }

    /// [`VeilConfig::load`] with a custom env resolver.
    ///
    /// # Errors
    ///
    /// Same as [`VeilConfig::load`].
    pub fn load_with(paths: &RuntimePaths, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::load_from_file(&paths.config_toml)?;
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("invalid config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has unknown cipher modes.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: VeilConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests need no process-global `set_var`.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("VEIL_ARTIFACT_SOURCE") {
            self.artifact.source = PathBuf::from(v);
        }
        if let Some(v) = env("VEIL_ENTRY") {
            self.artifact.entry = v;
        }
        if let Some(v) = env("VEIL_CIPHER_MODE") {
            match v.parse() {
                Ok(mode) => self.cipher.mode = mode,
                Err(_) => tracing::warn!(
                    var = "VEIL_CIPHER_MODE",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("VEIL_CACHE_DIR") {
            self.paths.cache_dir = Some(PathBuf::from(v));
        }
    }

    /// Check values the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged name is not a plain file name or the
    /// entry id is empty.
    pub fn validate(&self) -> Result<()> {
        let staged = Path::new(&self.artifact.staged_name);
        let plain = staged.file_name().is_some_and(|n| n == staged.as_os_str());
        if !plain {
            anyhow::bail!(
                "artifact.staged_name must be a plain file name, got {:?}",
                self.artifact.staged_name
            );
        }
        if self.artifact.entry.trim().is_empty() {
            anyhow::bail!("artifact.entry must not be empty");
        }
        if self.cipher.key_env.trim().is_empty() || self.cipher.iv_env.trim().is_empty() {
            anyhow::bail!("cipher.key_env and cipher.iv_env must name env vars");
        }
        Ok(())
    }

    /// Cache directory: the `[paths]` override or the runtime default.
    pub fn cache_dir(&self, paths: &RuntimePaths) -> PathBuf {
        self.paths
            .cache_dir
            .clone()
            .unwrap_or_else(|| paths.cache_dir.clone())
    }

    /// Scratch directory: the `[paths]` override or the runtime default.
    pub fn scratch_dir(&self, paths: &RuntimePaths) -> PathBuf {
        self.paths
            .scratch_dir
            .clone()
            .unwrap_or_else(|| paths.scratch_dir.clone())
    }
}

// ── Artifact config ─────────────────────────────────────────────

/// Where the encrypted artifact lives and what to load from it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Encrypted resource on disk.
    pub source: PathBuf,
    /// File name of the decrypted artifact inside the cache directory.
    pub staged_name: String,
    /// Entry id resolved inside the artifact.
    pub entry: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            source: PathBuf::from("assets/plugin_v1.dat"),
            staged_name: "plugin.wasm".to_owned(),
            entry: "plugin".to_owned(),
        }
    }
}

// ── Cipher config ───────────────────────────────────────────────

/// Transform mode and the env vars holding key material.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// `cbc` (default) or `sealed`.
    pub mode: CipherMode,
    /// Env var holding the hex-encoded 16-byte key.
    pub key_env: String,
    /// Env var holding the hex-encoded 16-byte IV.
    pub iv_env: String,
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            mode: CipherMode::default(),
            key_env: "VEIL_KEY".to_owned(),
            iv_env: "VEIL_IV".to_owned(),
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Optional directory overrides; unset fields fall back to [`RuntimePaths`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Private cache directory holding the staged artifact.
    pub cache_dir: Option<PathBuf>,
    /// Private scratch directory for module preparation.
    pub scratch_dir: Option<PathBuf>,
}

// ── Runtime paths ───────────────────────────────────────────────

/// Resolved locations under the runtime root (`~/.veil/` by default).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Runtime root directory.
    pub root: PathBuf,
    /// Config file path.
    pub config_toml: PathBuf,
    /// Private key file.
    pub keys_env: PathBuf,
    /// Default cache directory.
    pub cache_dir: PathBuf,
    /// Default scratch directory.
    pub scratch_dir: PathBuf,
    /// Log directory for production logging.
    pub logs_dir: PathBuf,
}

/// Resolve runtime paths under `~/.veil/`, honoring `$VEIL_CONFIG`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> Result<RuntimePaths> {
    runtime_paths_with(|key| std::env::var(key).ok())
}

/// [`runtime_paths`] with a custom env resolver.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths_with(env: impl Fn(&str) -> Option<String>) -> Result<RuntimePaths> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    let mut paths = runtime_paths_in(home.home_dir().join(RUNTIME_DIR));
    if let Some(p) = env("VEIL_CONFIG") {
        paths.config_toml = PathBuf::from(p);
    }
    Ok(paths)
}

/// Lay out runtime paths under an explicit root.
pub fn runtime_paths_in(root: impl Into<PathBuf>) -> RuntimePaths {
    let root = root.into();
    RuntimePaths {
        config_toml: root.join("veil.toml"),
        keys_env: root.join("keys.env"),
        cache_dir: root.join("cache"),
        scratch_dir: root.join("module_opt"),
        logs_dir: root.join("logs"),
        root,
    }
}

// ── Tests ───────────────────────────────────────────────────────
