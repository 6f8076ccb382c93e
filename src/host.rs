//! Host component bootstrap: stage, load, attach.
//!
//! [`Bootstrap::launch`] is what a host calls when its component is created.
//! It never fails. Staging and loading errors are logged and produce an
//! unattached delegate, so the host keeps running with no module behind it.

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::cipher::{KeyMaterial, StreamCipher};
use crate::config::{RuntimePaths, VeilConfig};
use crate::delegate::LifecycleDelegate;
use crate::lifecycle::{AttachContext, Lifecycle, ModuleId};
use crate::loader::{LoadError, ModuleLoader};
use crate::stager::{self, ArtifactSource, ArtifactStager, Staged, StagingError};

/// Failure of the stage-then-load sequence.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    /// Staging the artifact failed.
    #[error(transparent)]
    Staging(#[from] StagingError),
    /// Loading the staged artifact failed.
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Everything needed to bring a module up for one host component.
#[derive(Debug, Clone)]
pub struct Bootstrap {
    stager: ArtifactStager,
    staged_path: PathBuf,
    scratch_dir: PathBuf,
    entry: ModuleId,
}

impl Bootstrap {
    /// Build a bootstrap from explicit parts.
    pub fn new(
        cipher: StreamCipher,
        staged_path: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        entry: ModuleId,
    ) -> Self {
        Self {
            stager: ArtifactStager::new(cipher),
            staged_path: staged_path.into(),
            scratch_dir: scratch_dir.into(),
            entry,
        }
    }

    /// Build a bootstrap from loaded configuration and key material.
    pub fn from_config(config: &VeilConfig, paths: &RuntimePaths, key: KeyMaterial) -> Self {
        let cache_dir = config.cache_dir(paths);
        Self::new(
            StreamCipher::new(key, config.cipher.mode),
            cache_dir.join(&config.artifact.staged_name),
            config.scratch_dir(paths),
            ModuleId::new(config.artifact.entry.clone()),
        )
    }

    /// Where the decrypted artifact is staged.
    pub fn staged_path(&self) -> &Path {
        &self.staged_path
    }

    /// Entry id resolved on load.
    pub fn entry(&self) -> &ModuleId {
        &self.entry
    }

    /// Stage `source` without loading it.
    ///
    /// # Errors
    ///
    /// Returns the staging failure.
    pub fn stage(&self, source: &dyn ArtifactSource) -> Result<Staged, StagingError> {
        self.stager.stage(source, &self.staged_path)
    }

    /// Stage and load, clearing the staged file when loading fails so the
    /// next launch decrypts again.
    ///
    /// # Errors
    ///
    /// Returns the staging or loading failure.
    pub fn prepare(&self, source: &dyn ArtifactSource) -> Result<Box<dyn Lifecycle>, BootstrapError> {
        let staged = self.stage(source)?;
        info!(entry = %self.entry, outcome = ?staged, "artifact ready");

        let loaded = ModuleLoader::new(&self.scratch_dir)
            .and_then(|loader| loader.load(&self.staged_path, &self.entry));
        match loaded {
            Ok(module) => Ok(module),
            Err(e) => {
                if let Err(clear_err) = stager::clear(&self.staged_path) {
                    warn!(error = %clear_err, "failed to clear staged artifact after load failure");
                }
                Err(e.into())
            }
        }
    }

    /// Stage, load and attach. Always returns a delegate; on failure it is
    /// unattached and ignores every event.
    pub fn launch(&self, source: &dyn ArtifactSource, context: AttachContext) -> LifecycleDelegate {
        let module = match self.prepare(source) {
            Ok(module) => Some(module),
            Err(e) => {
                error!(
                    source = %source.name(),
                    entry = %self.entry,
                    error = %e,
                    "module bootstrap failed, continuing without module"
                );
                None
            }
        };

        let mut delegate = LifecycleDelegate::new();
        if let Err(e) = delegate.attach(module, &context) {
            error!(error = %e, "fresh delegate refused attach");
        }
        delegate
    }
}
