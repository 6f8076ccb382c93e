//! The Lifecycle capability a loaded module must implement.
//!
//! [`LifecycleDelegate`](crate::delegate::LifecycleDelegate) is the only
//! caller. Implementations report failures as [`ModuleFault`]; the delegate
//! logs them and keeps the host running.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an entry point inside a module artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleId(String);

impl ModuleId {
    /// Wrap an entry identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters handed to a module when it is attached to the host.
///
/// Opaque to the delegate. Loaded modules receive it JSON-encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachContext {
    /// Launch parameters (e.g. `token`, `url`).
    pub params: BTreeMap<String, String>,
}

impl AttachContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing any previous value for `key`.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Look up a parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// A module callback failed (trap, bad pointer, encoding error).
#[derive(Debug, Clone, thiserror::Error)]
#[error("module {entry} faulted in {method}: {reason}")]
pub struct ModuleFault {
    /// Entry identifier of the faulting module.
    pub entry: String,
    /// Lifecycle method that was running.
    pub method: &'static str,
    /// Diagnostics from the module runtime.
    pub reason: String,
}

impl ModuleFault {
    /// Build a fault for `method` of `entry`.
    pub fn new(entry: impl Into<String>, method: &'static str, reason: impl fmt::Display) -> Self {
        Self {
            entry: entry.into(),
            method,
            reason: reason.to_string(),
        }
    }
}

/// Host lifecycle callbacks forwarded to a loaded module.
pub trait Lifecycle {
    /// Bind the module to its host with launch parameters. Called once, first.
    fn attach(&mut self, context: &AttachContext) -> Result<(), ModuleFault>;

    /// The host component was created; `saved_state` is present on re-creation.
    fn on_create(&mut self, saved_state: Option<&[u8]>) -> Result<(), ModuleFault>;

    /// The host component became visible.
    fn on_start(&mut self) -> Result<(), ModuleFault>;

    /// The host component moved to the foreground.
    fn on_resume(&mut self) -> Result<(), ModuleFault>;

    /// The host component left the foreground.
    fn on_pause(&mut self) -> Result<(), ModuleFault>;

    /// The host component is no longer visible.
    fn on_stop(&mut self) -> Result<(), ModuleFault>;

    /// The host component is being destroyed. No further calls follow.
    fn on_destroy(&mut self) -> Result<(), ModuleFault>;

    /// The user requested back navigation.
    fn on_back_pressed(&mut self) -> Result<(), ModuleFault>;

    /// Whether the host may perform its default back navigation.
    fn can_exit(&mut self) -> Result<bool, ModuleFault>;

    /// A result from a sub-component the module launched.
    fn on_activity_result(
        &mut self,
        request_code: i32,
        result_code: i32,
        data: Option<&[u8]>,
    ) -> Result<(), ModuleFault>;
}
