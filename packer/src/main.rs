//! Veil packer CLI entry point.
//!
//! Provides `encrypt`, `decrypt`, `verify`, and `keygen` subcommands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use veil::cipher::{CipherMode, StreamCipher};
use veil::config::{runtime_paths, VeilConfig};
use veil::keys::{generate_key_material, load_key_material, write_keys_file};
use veil_packer::pack::{decrypt_file, encrypt_file};
use veil_packer::verify::verify;

/// Veil packer — prepare encrypted artifacts for shipping.
#[derive(Parser)]
#[command(name = "veil-packer", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Encrypt a compiled module into a shippable artifact.
    Encrypt {
        /// Plaintext module.
        #[arg(long)]
        input: PathBuf,
        /// Encrypted artifact to write.
        #[arg(long)]
        output: PathBuf,
        /// Wire format; defaults to the configured mode.
        #[arg(long)]
        mode: Option<CipherMode>,
    },
    /// Decrypt an artifact back to the plaintext module.
    Decrypt {
        /// Encrypted artifact.
        #[arg(long)]
        input: PathBuf,
        /// Plaintext module to write.
        #[arg(long)]
        output: PathBuf,
        /// Wire format; defaults to the configured mode.
        #[arg(long)]
        mode: Option<CipherMode>,
    },
    /// Check that an artifact decrypts to the given source module.
    Verify {
        /// Plaintext module.
        #[arg(long)]
        source: PathBuf,
        /// Encrypted artifact.
        #[arg(long)]
        encrypted: PathBuf,
        /// Wire format; defaults to the configured mode.
        #[arg(long)]
        mode: Option<CipherMode>,
    },
    /// Generate fresh key material into a private key file.
    Keygen {
        /// Key file to create; defaults to `~/.veil/keys.env`.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    veil::logging::init_cli();

    match cli.command {
        Command::Encrypt {
            input,
            output,
            mode,
        } => {
            let bytes = encrypt_file(&cipher(mode)?, &input, &output)?;
            println!("encrypted {bytes} bytes into {}", output.display());
        }
        Command::Decrypt {
            input,
            output,
            mode,
        } => {
            let bytes = decrypt_file(&cipher(mode)?, &input, &output)?;
            println!("decrypted {bytes} bytes into {}", output.display());
        }
        Command::Verify {
            source,
            encrypted,
            mode,
        } => {
            let report = verify(&cipher(mode)?, &source, &encrypted)?;
            if !report.matches() {
                anyhow::bail!(
                    "digest mismatch: source {} vs decrypted {}",
                    report.source_sha256,
                    report.decrypted_sha256
                );
            }
            println!("ok sha256={} bytes={}", report.source_sha256, report.decrypted_len);
        }
        Command::Keygen { output } => {
            let paths = runtime_paths()?;
            let config = VeilConfig::load(&paths)?;
            let path = output.unwrap_or(paths.keys_env);
            write_keys_file(&path, &config.cipher, &generate_key_material()?)?;
            println!("wrote key material to {}", path.display());
        }
    }
    Ok(())
}

/// Build the cipher from configured key material and an optional mode override.
fn cipher(mode: Option<CipherMode>) -> anyhow::Result<StreamCipher> {
    let paths = runtime_paths()?;
    let config = VeilConfig::load(&paths)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    let key = load_key_material(&config.cipher, &paths.keys_env)
        .context("failed to resolve key material")?;
    Ok(StreamCipher::new(key, mode.unwrap_or(config.cipher.mode)))
}
