//! Veil CLI entry point.
//!
//! Provides `stage`, `run`, and `clear` subcommands for materialising the
//! configured artifact, driving it through a full host lifecycle, or
//! dropping the staged copy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use veil::config::{runtime_paths, RuntimePaths, VeilConfig};
use veil::host::Bootstrap;
use veil::keys::load_key_material;
use veil::lifecycle::AttachContext;
use veil::stager::{self, FileSource, Staged};

/// Veil — run an encrypted module behind a host lifecycle.
#[derive(Parser)]
#[command(name = "veil", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Decrypt the configured artifact into the cache, if not already there.
    Stage,
    /// Bootstrap the module and drive one full host lifecycle.
    Run {
        /// Launch parameter passed to the module on attach (`key=value`).
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Remove the staged artifact so the next launch decrypts again.
    Clear,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = runtime_paths()?;

    match cli.command {
        Command::Stage => {
            veil::logging::init_cli();
            handle_stage(&paths)
        }
        Command::Run { params } => {
            let _logging_guard = veil::logging::init_production(&paths.logs_dir)?;
            handle_run(&paths, params)
        }
        Command::Clear => {
            veil::logging::init_cli();
            handle_clear(&paths)
        }
    }
}

fn bootstrap(paths: &RuntimePaths) -> anyhow::Result<(VeilConfig, Bootstrap)> {
    let config = VeilConfig::load(paths)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    let key = load_key_material(&config.cipher, &paths.keys_env)
        .context("failed to resolve key material")?;
    let bootstrap = Bootstrap::from_config(&config, paths, key);
    Ok((config, bootstrap))
}

/// Stage the configured artifact and report the outcome.
fn handle_stage(paths: &RuntimePaths) -> anyhow::Result<()> {
    let (config, bootstrap) = bootstrap(paths)?;
    let source = FileSource::new(&config.artifact.source);

    match bootstrap.stage(&source).context("staging failed")? {
        Staged::Fresh { bytes } => {
            println!("staged {bytes} bytes at {}", bootstrap.staged_path().display());
        }
        Staged::Cached => {
            println!("already staged at {}", bootstrap.staged_path().display());
        }
    }
    Ok(())
}

/// Bootstrap and run create → start → resume → back → pause → stop → destroy.
fn handle_run(paths: &RuntimePaths, params: Vec<(String, String)>) -> anyhow::Result<()> {
    let (config, bootstrap) = bootstrap(paths)?;
    let source = FileSource::new(&config.artifact.source);
    let context = params
        .into_iter()
        .fold(AttachContext::new(), |ctx, (k, v)| ctx.with_param(k, v));

    let mut delegate = bootstrap.launch(&source, context);
    if !delegate.has_module() {
        warn!("running host lifecycle without a module");
    }

    delegate.forward_create(None);
    delegate.forward_start();
    delegate.forward_resume();
    let may_exit = delegate.forward_back_request();
    info!(may_exit, "back request handled");
    delegate.forward_pause();
    delegate.forward_stop();
    delegate.forward_destroy();

    println!(
        "lifecycle complete: state={} back_allowed={may_exit}",
        delegate.state().as_str()
    );
    Ok(())
}

/// Remove the staged artifact.
fn handle_clear(paths: &RuntimePaths) -> anyhow::Result<()> {
    let config = VeilConfig::load(paths)
        .with_context(|| format!("failed to load {}", paths.config_toml.display()))?;
    let staged = config.cache_dir(paths).join(&config.artifact.staged_name);

    if stager::clear(&staged)? {
        println!("removed {}", staged.display());
    } else {
        println!("nothing staged at {}", staged.display());
    }
    Ok(())
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err("parameter key must not be empty".to_owned());
    }
    Ok((key.to_owned(), value.to_owned()))
}
