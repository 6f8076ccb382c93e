//! Load a staged WebAssembly artifact and bind it as a [`Lifecycle`].
//!
//! The artifact is a core wasm module (binary or text) whose exports follow
//! a fixed ABI, with every lifecycle function prefixed by the entry id:
//!
//! | export | signature |
//! |---|---|
//! | `memory` | linear memory |
//! | `alloc` | `(len) -> ptr` |
//! | `<entry>.new` | `() -> handle`, negative on failure |
//! | `<entry>.attach`, `<entry>.on_create` | `(handle, ptr, len)` |
//! | `<entry>.on_start` .. `<entry>.on_back_pressed` | `(handle)` |
//! | `<entry>.can_exit` | `(handle) -> i32`, non-zero allows exit |
//! | `<entry>.on_activity_result` | `(handle, request, result, ptr, len)` |
//!
//! The host offers one import, `veil.log(level, ptr, len)`, routed into
//! `tracing`. Every export is resolved and type-checked before the
//! constructor runs, so a module missing part of the capability is rejected
//! before any lifecycle code of it is called. A wasm `start` function is
//! the exception: it runs during instantiation, ahead of those checks, and
//! a trap there is reported as [`LoadError::Instantiation`].

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, trace, warn};
use wasmtime::{Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, Store, TypedFunc};

use crate::lifecycle::{AttachContext, Lifecycle, ModuleFault, ModuleId};

/// Tracing target for messages a module sends through `veil.log`.
pub const GUEST_LOG_TARGET: &str = "veil::module";

/// Unix mode of the scratch directory.
const SCRATCH_MODE: u32 = 0o700;

/// Name of the compilation cache settings file inside the scratch directory.
const CACHE_CONFIG_FILE: &str = "wasmtime-cache.toml";

/// Errors produced while loading a module.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The scratch directory could not be prepared.
    #[error("failed to prepare scratch directory {}: {reason}", .path.display())]
    Scratch {
        /// Scratch directory path.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
    /// The module runtime could not be initialised.
    #[error("module runtime unavailable: {0}")]
    Runtime(String),
    /// The artifact could not be read or is not valid bytecode.
    #[error("artifact {} is unreadable: {reason}", .path.display())]
    ArtifactUnreadable {
        /// Staged artifact path.
        path: PathBuf,
        /// Read or compile diagnostics.
        reason: String,
    },
    /// The artifact has no constructor for the requested entry.
    #[error("entry {entry} not found in artifact")]
    EntryNotFound {
        /// Requested entry id.
        entry: String,
    },
    /// Linking, the start function or the constructor failed.
    #[error("failed to instantiate entry {entry}: {reason}")]
    Instantiation {
        /// Requested entry id.
        entry: String,
        /// Runtime diagnostics.
        reason: String,
    },
    /// A lifecycle export is absent or has the wrong signature.
    #[error("entry {entry} lacks capability export {export}: {reason}")]
    CapabilityMissing {
        /// Requested entry id.
        entry: String,
        /// Export name.
        export: String,
        /// Runtime diagnostics.
        reason: String,
    },
}

/// Per-instance host state visible to imports.
struct HostState {
    entry: String,
}

/// Compiles and instantiates staged artifacts.
pub struct ModuleLoader {
    engine: Engine,
    scratch_dir: PathBuf,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}

impl ModuleLoader {
    /// Prepare the scratch directory and the module runtime.
    ///
    /// The scratch directory backs the compilation cache. If the cache
    /// cannot be enabled the loader still works, compiling on every load.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::Scratch`] if the directory cannot be created and
    /// [`LoadError::Runtime`] if the engine cannot be built.
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let scratch_dir = scratch_dir.into();
        prepare_scratch(&scratch_dir)?;

        let mut config = Config::new();
        match write_cache_config(&scratch_dir) {
            Ok(cache_toml) => {
                if let Err(e) = config.cache_config_load(&cache_toml) {
                    warn!(path = %cache_toml.display(), error = %e, "compilation cache disabled");
                }
            }
            Err(e) => {
                warn!(path = %scratch_dir.display(), error = %e, "compilation cache disabled");
            }
        }

        let engine = Engine::new(&config).map_err(|e| LoadError::Runtime(format!("{e:#}")))?;
        debug!(scratch = %scratch_dir.display(), "module loader ready");
        Ok(Self {
            engine,
            scratch_dir,
        })
    }

    /// Scratch directory backing the compilation cache.
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Load `artifact`, resolve `entry` and construct a bound instance.
    ///
    /// # Errors
    ///
    /// See [`LoadError`] for the failure taxonomy.
    pub fn load(&self, artifact: &Path, entry: &ModuleId) -> Result<Box<dyn Lifecycle>, LoadError> {
        let bytes = fs::read(artifact).map_err(|e| LoadError::ArtifactUnreadable {
            path: artifact.to_path_buf(),
            reason: e.to_string(),
        })?;
        let module =
            Module::new(&self.engine, &bytes).map_err(|e| LoadError::ArtifactUnreadable {
                path: artifact.to_path_buf(),
                reason: format!("{e:#}"),
            })?;

        let ctor_name = export_name(entry, "new");
        if !module.exports().any(|export| export.name() == ctor_name) {
            error!(entry = %entry, artifact = %artifact.display(), "entry constructor missing");
            return Err(LoadError::EntryNotFound {
                entry: entry.to_string(),
            });
        }

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        linker
            .func_wrap("veil", "log", guest_log)
            .map_err(|e| LoadError::Runtime(format!("{e:#}")))?;

        let mut store = Store::new(
            &self.engine,
            HostState {
                entry: entry.to_string(),
            },
        );
        let instance =
            linker
                .instantiate(&mut store, &module)
                .map_err(|e| LoadError::Instantiation {
                    entry: entry.to_string(),
                    reason: format!("{e:#}"),
                })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LoadError::CapabilityMissing {
                entry: entry.to_string(),
                export: "memory".to_owned(),
                reason: "no exported memory".to_owned(),
            })?;
        let alloc = typed::<i32, i32>(&instance, &mut store, entry, "alloc".to_owned())?;
        let ctor = typed::<(), i32>(&instance, &mut store, entry, ctor_name)?;
        let exports = LifecycleExports::resolve(&instance, &mut store, entry)?;

        let handle = ctor
            .call(&mut store, ())
            .map_err(|e| LoadError::Instantiation {
                entry: entry.to_string(),
                reason: format!("constructor trapped: {e:#}"),
            })?;
        if handle < 0 {
            return Err(LoadError::Instantiation {
                entry: entry.to_string(),
                reason: format!("constructor returned {handle}"),
            });
        }

        info!(entry = %entry, artifact = %artifact.display(), handle, "module loaded");
        Ok(Box::new(WasmModule {
            entry: entry.to_string(),
            store,
            memory,
            alloc,
            handle,
            exports,
        }))
    }
}

// -- Exports --

/// Typed handles for every lifecycle export of one entry.
struct LifecycleExports {
    attach: TypedFunc<(i32, i32, i32), ()>,
    on_create: TypedFunc<(i32, i32, i32), ()>,
    on_start: TypedFunc<i32, ()>,
    on_resume: TypedFunc<i32, ()>,
    on_pause: TypedFunc<i32, ()>,
    on_stop: TypedFunc<i32, ()>,
    on_destroy: TypedFunc<i32, ()>,
    on_back_pressed: TypedFunc<i32, ()>,
    can_exit: TypedFunc<i32, i32>,
    on_activity_result: TypedFunc<(i32, i32, i32, i32, i32), ()>,
}

impl LifecycleExports {
    fn resolve(
        instance: &Instance,
        store: &mut Store<HostState>,
        entry: &ModuleId,
    ) -> Result<Self, LoadError> {
        let name = |method: &str| export_name(entry, method);
        Ok(Self {
            attach: typed(instance, store, entry, name("attach"))?,
            on_create: typed(instance, store, entry, name("on_create"))?,
            on_start: typed(instance, store, entry, name("on_start"))?,
            on_resume: typed(instance, store, entry, name("on_resume"))?,
            on_pause: typed(instance, store, entry, name("on_pause"))?,
            on_stop: typed(instance, store, entry, name("on_stop"))?,
            on_destroy: typed(instance, store, entry, name("on_destroy"))?,
            on_back_pressed: typed(instance, store, entry, name("on_back_pressed"))?,
            can_exit: typed(instance, store, entry, name("can_exit"))?,
            on_activity_result: typed(instance, store, entry, name("on_activity_result"))?,
        })
    }
}

fn typed<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    entry: &ModuleId,
    export: String,
) -> Result<TypedFunc<P, R>, LoadError>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut *store, &export)
        .map_err(|e| LoadError::CapabilityMissing {
            entry: entry.to_string(),
            export,
            reason: format!("{e:#}"),
        })
}

fn export_name(entry: &ModuleId, method: &str) -> String {
    format!("{entry}.{method}")
}

// -- Bound instance --

/// A constructed module instance, exclusively owned by its delegate.
struct WasmModule {
    entry: String,
    store: Store<HostState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    handle: i32,
    exports: LifecycleExports,
}

impl WasmModule {
    /// Copy `bytes` into guest memory; empty payloads are passed as `(0, 0)`.
    fn write_payload(&mut self, method: &'static str, bytes: &[u8]) -> Result<(i32, i32), ModuleFault> {
        if bytes.is_empty() {
            return Ok((0, 0));
        }
        let len = i32::try_from(bytes.len())
            .map_err(|_| ModuleFault::new(&self.entry, method, "payload too large"))?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .map_err(|e| ModuleFault::new(&self.entry, method, format!("alloc trapped: {e:#}")))?;
        let offset = usize::try_from(ptr).map_err(|_| {
            ModuleFault::new(&self.entry, method, format!("alloc returned {ptr}"))
        })?;
        self.memory
            .write(&mut self.store, offset, bytes)
            .map_err(|e| ModuleFault::new(&self.entry, method, e))?;
        Ok((ptr, len))
    }

    fn invoke(
        &mut self,
        method: &'static str,
        pick: fn(&LifecycleExports) -> &TypedFunc<i32, ()>,
    ) -> Result<(), ModuleFault> {
        trace!(entry = %self.entry, method, "calling module");
        pick(&self.exports)
            .call(&mut self.store, self.handle)
            .map_err(|e| ModuleFault::new(&self.entry, method, format!("{e:#}")))
    }
}

impl Lifecycle for WasmModule {
    fn attach(&mut self, context: &AttachContext) -> Result<(), ModuleFault> {
        let json = serde_json::to_vec(context)
            .map_err(|e| ModuleFault::new(&self.entry, "attach", e))?;
        let (ptr, len) = self.write_payload("attach", &json)?;
        self.exports
            .attach
            .call(&mut self.store, (self.handle, ptr, len))
            .map_err(|e| ModuleFault::new(&self.entry, "attach", format!("{e:#}")))
    }

    fn on_create(&mut self, saved_state: Option<&[u8]>) -> Result<(), ModuleFault> {
        let (ptr, len) = self.write_payload("on_create", saved_state.unwrap_or_default())?;
        self.exports
            .on_create
            .call(&mut self.store, (self.handle, ptr, len))
            .map_err(|e| ModuleFault::new(&self.entry, "on_create", format!("{e:#}")))
    }

    fn on_start(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_start", |e| &e.on_start)
    }

    fn on_resume(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_resume", |e| &e.on_resume)
    }

    fn on_pause(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_pause", |e| &e.on_pause)
    }

    fn on_stop(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_stop", |e| &e.on_stop)
    }

    fn on_destroy(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_destroy", |e| &e.on_destroy)
    }

    fn on_back_pressed(&mut self) -> Result<(), ModuleFault> {
        self.invoke("on_back_pressed", |e| &e.on_back_pressed)
    }

    fn can_exit(&mut self) -> Result<bool, ModuleFault> {
        let verdict = self
            .exports
            .can_exit
            .call(&mut self.store, self.handle)
            .map_err(|e| ModuleFault::new(&self.entry, "can_exit", format!("{e:#}")))?;
        Ok(verdict != 0)
    }

    fn on_activity_result(
        &mut self,
        request_code: i32,
        result_code: i32,
        data: Option<&[u8]>,
    ) -> Result<(), ModuleFault> {
        let (ptr, len) = self.write_payload("on_activity_result", data.unwrap_or_default())?;
        self.exports
            .on_activity_result
            .call(
                &mut self.store,
                (self.handle, request_code, result_code, ptr, len),
            )
            .map_err(|e| ModuleFault::new(&self.entry, "on_activity_result", format!("{e:#}")))
    }
}

// -- Host imports --

/// `veil.log(level, ptr, len)`: 0 trace, 1 debug, 2 info, 3 warn, otherwise error.
fn guest_log(mut caller: Caller<'_, HostState>, level: i32, ptr: i32, len: i32) {
    let Some(memory) = caller.get_export("memory").and_then(Extern::into_memory) else {
        warn!(entry = %caller.data().entry, "module logged without exported memory");
        return;
    };
    let Some(message) = read_guest_str(memory.data(&caller), ptr, len) else {
        warn!(entry = %caller.data().entry, ptr, len, "module logged out-of-bounds message");
        return;
    };
    let entry = caller.data().entry.as_str();
    match level {
        0 => trace!(target: GUEST_LOG_TARGET, entry, "{message}"),
        1 => debug!(target: GUEST_LOG_TARGET, entry, "{message}"),
        2 => info!(target: GUEST_LOG_TARGET, entry, "{message}"),
        3 => warn!(target: GUEST_LOG_TARGET, entry, "{message}"),
        _ => error!(target: GUEST_LOG_TARGET, entry, "{message}"),
    }
}

fn read_guest_str(data: &[u8], ptr: i32, len: i32) -> Option<String> {
    let start = usize::try_from(ptr).ok()?;
    let len = usize::try_from(len).ok()?;
    let end = start.checked_add(len)?;
    let bytes = data.get(start..end)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

// -- Scratch directory --

fn prepare_scratch(dir: &Path) -> Result<(), LoadError> {
    let scratch_err = |e: std::io::Error| LoadError::Scratch {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    };
    fs::create_dir_all(dir).map_err(scratch_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        fs::set_permissions(dir, fs::Permissions::from_mode(SCRATCH_MODE)).map_err(scratch_err)?;
    }
    Ok(())
}

/// Write the cache settings file pointing wasmtime at `<scratch>/cache`.
fn write_cache_config(scratch_dir: &Path) -> anyhow::Result<PathBuf> {
    use anyhow::Context;

    let cache_dir = scratch_dir.join("cache");
    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("failed to create {}", cache_dir.display()))?;
    let cache_dir = fs::canonicalize(&cache_dir)
        .with_context(|| format!("failed to resolve {}", cache_dir.display()))?;

    let mut cache = toml::Table::new();
    cache.insert("enabled".to_owned(), toml::Value::Boolean(true));
    cache.insert(
        "directory".to_owned(),
        toml::Value::String(cache_dir.display().to_string()),
    );
    let mut root = toml::Table::new();
    root.insert("cache".to_owned(), toml::Value::Table(cache));

    let path = scratch_dir.join(CACHE_CONFIG_FILE);
    fs::write(&path, toml::to_string(&root)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
