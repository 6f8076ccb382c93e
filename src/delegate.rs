//! Host lifecycle delegation state machine.
//!
//! A [`LifecycleDelegate`] owns at most one loaded module and relays host
//! events to it in the order they arrive. Every forwarded event goes through
//! [`LifecycleDelegate::dispatch`]. With nothing attached, events are
//! accepted and ignored, and the delegate stays [`DelegateState::Unattached`].
//! Attach is the exception: only [`LifecycleDelegate::attach`] delivers it,
//! once.
//!
//! The delegate does not police the host's event order. It forwards what it
//! receives and records the state implied by the last event.

use tracing::{debug, info, warn};

use crate::lifecycle::{AttachContext, Lifecycle, ModuleFault};

/// Position in the host component lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegateState {
    /// No module bound (initial state, and the permanent state of a degraded delegate).
    Unattached,
    /// Module bound, host component not yet created.
    Attached,
    /// `Create` delivered.
    Created,
    /// `Start` delivered.
    Started,
    /// `Resume` delivered.
    Resumed,
    /// `Pause` delivered.
    Paused,
    /// `Stop` delivered.
    Stopped,
    /// `Destroy` delivered; the module has been released.
    Destroyed,
}

impl DelegateState {
    /// State reached after `event` is delivered from `self`.
    ///
    /// `BackRequest` and `ResultDelivery` are reentrant and never move the
    /// machine.
    pub fn after(self, event: &LifecycleEvent<'_>) -> Self {
        match event {
            LifecycleEvent::Attach(_) => Self::Attached,
            LifecycleEvent::Create { .. } => Self::Created,
            LifecycleEvent::Start => Self::Started,
            LifecycleEvent::Resume => Self::Resumed,
            LifecycleEvent::Pause => Self::Paused,
            LifecycleEvent::Stop => Self::Stopped,
            LifecycleEvent::Destroy => Self::Destroyed,
            LifecycleEvent::BackRequest | LifecycleEvent::ResultDelivery { .. } => self,
        }
    }

    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unattached => "unattached",
            Self::Attached => "attached",
            Self::Created => "created",
            Self::Started => "started",
            Self::Resumed => "resumed",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Destroyed => "destroyed",
        }
    }
}

/// A host lifecycle or control event with its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent<'a> {
    /// Bind the module with launch parameters.
    Attach(&'a AttachContext),
    /// Host component created.
    Create {
        /// State saved by a previous incarnation, if any.
        saved_state: Option<&'a [u8]>,
    },
    /// Host component visible.
    Start,
    /// Host component in the foreground.
    Resume,
    /// Host component leaving the foreground.
    Pause,
    /// Host component hidden.
    Stop,
    /// Host component destroyed.
    Destroy,
    /// Back navigation requested.
    BackRequest,
    /// Result from a launched sub-component.
    ResultDelivery {
        /// Code the module used when launching.
        request_code: i32,
        /// Status reported by the sub-component.
        result_code: i32,
        /// Optional result payload.
        data: Option<&'a [u8]>,
    },
}

impl LifecycleEvent<'_> {
    /// Event name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attach(_) => "attach",
            Self::Create { .. } => "create",
            Self::Start => "start",
            Self::Resume => "resume",
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
            Self::BackRequest => "back_request",
            Self::ResultDelivery { .. } => "result_delivery",
        }
    }
}

/// Errors from misuse of the delegate API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegateError {
    /// `attach` was already called on this delegate.
    #[error("delegate is already attached")]
    AlreadyAttached,
}

/// Owns a loaded module and forwards host events to it.
pub struct LifecycleDelegate {
    state: DelegateState,
    module: Option<Box<dyn Lifecycle>>,
    attach_called: bool,
}

impl std::fmt::Debug for LifecycleDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleDelegate")
            .field("state", &self.state)
            .field("has_module", &self.module.is_some())
            .finish()
    }
}

impl Default for LifecycleDelegate {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleDelegate {
    /// Create an unattached delegate.
    pub fn new() -> Self {
        Self {
            state: DelegateState::Unattached,
            module: None,
            attach_called: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DelegateState {
        self.state
    }

    /// Whether a module is currently bound.
    pub fn has_module(&self) -> bool {
        self.module.is_some()
    }

    /// Bind `module` (or nothing, when loading failed) with launch parameters.
    ///
    /// Must be the first call. With a module, its `attach` callback runs and
    /// the delegate moves to [`DelegateState::Attached`]. Without one, the
    /// delegate stays unattached and every later event is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DelegateError::AlreadyAttached`] on a second call; nothing
    /// changes in that case.
    pub fn attach(
        &mut self,
        module: Option<Box<dyn Lifecycle>>,
        context: &AttachContext,
    ) -> Result<(), DelegateError> {
        if self.attach_called {
            warn!(state = self.state.as_str(), "ignoring repeated attach");
            return Err(DelegateError::AlreadyAttached);
        }
        self.attach_called = true;

        match module {
            Some(module) => {
                self.module = Some(module);
                self.apply(LifecycleEvent::Attach(context));
                info!("module attached to host lifecycle");
            }
            None => {
                warn!("no module available, host events will be ignored");
            }
        }
        Ok(())
    }

    /// Forward the host's create event.
    pub fn forward_create(&mut self, saved_state: Option<&[u8]>) {
        self.dispatch(LifecycleEvent::Create { saved_state });
    }

    /// Forward the host's start event.
    pub fn forward_start(&mut self) {
        self.dispatch(LifecycleEvent::Start);
    }

    /// Forward the host's resume event.
    pub fn forward_resume(&mut self) {
        self.dispatch(LifecycleEvent::Resume);
    }

    /// Forward the host's pause event.
    pub fn forward_pause(&mut self) {
        self.dispatch(LifecycleEvent::Pause);
    }

    /// Forward the host's stop event.
    pub fn forward_stop(&mut self) {
        self.dispatch(LifecycleEvent::Stop);
    }

    /// Forward the host's destroy event and release the module.
    pub fn forward_destroy(&mut self) {
        self.dispatch(LifecycleEvent::Destroy);
    }

    /// Forward a back-navigation request.
    ///
    /// Returns `false` when the module vetoes the host's default back
    /// navigation, `true` otherwise (including when no module is bound).
    pub fn forward_back_request(&mut self) -> bool {
        self.dispatch(LifecycleEvent::BackRequest)
    }

    /// Forward a sub-component result, regardless of the current state.
    pub fn forward_activity_result(
        &mut self,
        request_code: i32,
        result_code: i32,
        data: Option<&[u8]>,
    ) {
        self.dispatch(LifecycleEvent::ResultDelivery {
            request_code,
            result_code,
            data,
        });
    }

    /// Deliver one event and advance the state machine.
    ///
    /// Returns whether the host should go ahead with its default handling;
    /// only a back request can yield `false`. Module faults are logged and
    /// swallowed. An [`LifecycleEvent::Attach`] is refused here and changes
    /// nothing: binding goes through [`LifecycleDelegate::attach`] only.
    pub fn dispatch(&mut self, event: LifecycleEvent<'_>) -> bool {
        if matches!(event, LifecycleEvent::Attach(_)) {
            warn!(
                state = self.state.as_str(),
                "attach event refused outside attach()"
            );
            return true;
        }
        self.apply(event)
    }

    fn apply(&mut self, event: LifecycleEvent<'_>) -> bool {
        let Some(module) = self.module.as_deref_mut() else {
            debug!(event = event.name(), "no module bound, event ignored");
            return true;
        };

        let proceed = match deliver(module, &event) {
            Ok(proceed) => proceed,
            Err(fault) => {
                warn!(event = event.name(), error = %fault, "module fault during forward");
                true
            }
        };

        let next = self.state.after(&event);
        debug!(
            event = event.name(),
            from = self.state.as_str(),
            to = next.as_str(),
            "event forwarded"
        );
        self.state = next;

        if next == DelegateState::Destroyed {
            self.module = None;
            debug!("module released");
        }
        proceed
    }
}

/// Call the module method matching `event`.
fn deliver(module: &mut dyn Lifecycle, event: &LifecycleEvent<'_>) -> Result<bool, ModuleFault> {
    match *event {
        LifecycleEvent::Attach(context) => module.attach(context)?,
        LifecycleEvent::Create { saved_state } => module.on_create(saved_state)?,
        LifecycleEvent::Start => module.on_start()?,
        LifecycleEvent::Resume => module.on_resume()?,
        LifecycleEvent::Pause => module.on_pause()?,
        LifecycleEvent::Stop => module.on_stop()?,
        LifecycleEvent::Destroy => module.on_destroy()?,
        LifecycleEvent::BackRequest => {
            module.on_back_pressed()?;
            return module.can_exit();
        }
        LifecycleEvent::ResultDelivery {
            request_code,
            result_code,
            data,
        } => module.on_activity_result(request_code, result_code, data)?,
    }
    Ok(true)
}
