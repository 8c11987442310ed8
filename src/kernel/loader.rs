//! Module registry and lifecycle state machine.
//!
//! ```text
//! registered ──start──▶ running ──stop──▶ stopped
//!      │                  │  └──hook error──▶ error
//!      └──────────────────┴──isolate──▶ isolated
//! isolated | error ──reset──▶ registered
//! ```
//!
//! Every transition publishes `kernel:lifecycle.transition`. Teardown runs on
//! every exit from `running` and reclaims everything the module's context
//! recorded.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::kernel::clock::Clock;
use crate::kernel::context::{ModuleContext, ResourceCounts};
use crate::kernel::error::KernelError;
use crate::kernel::event_bus::EventBus;
use crate::kernel::manifest::{report_invalid, validate_manifest, ManifestError, ManifestSummary, ModuleManifest};
use crate::kernel::permission::{Permission, PermissionContext, PermissionSystem};
use crate::kernel::scheduler::Scheduler;
use crate::kernel::schema::SchemaRegistry;
use crate::kernel::{is_valid_name, KERNEL_SOURCE};

/// Event name of lifecycle transition records.
pub const LIFECYCLE_EVENT: &str = "kernel:lifecycle.transition";

// ---------------------------------------------------------------------------
// Module trait and registration
// ---------------------------------------------------------------------------

/// A unit of functionality hosted by the kernel.
///
/// Errors returned from the hooks are contained: they are reported as
/// `diagnostic:module_error` and move the module to the `error` state.
pub trait KernelModule {
    /// Unique module name; must match the naming pattern.
    fn name(&self) -> &str;

    /// Called when the module enters `running`.
    ///
    /// # Errors
    ///
    /// Any error aborts the start and moves the module to `error`.
    fn start(&self, ctx: &ModuleContext) -> anyhow::Result<()>;

    /// Called before teardown when the module leaves `running`.
    ///
    /// # Errors
    ///
    /// Any error moves the module to `error`; teardown still runs.
    fn stop(&self, _ctx: &ModuleContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What to register: a bare module, or a module described by a manifest.
pub enum RegistrationRequest {
    /// Module without a manifest; it gets no permissions.
    Legacy(Rc<dyn KernelModule>),
    /// Module plus the manifest that grants its permissions and declares
    /// its schemas.
    Declared {
        /// Manifest whose id must equal the module name.
        manifest: ModuleManifest,
        /// The module itself.
        module: Rc<dyn KernelModule>,
    },
}

impl RegistrationRequest {
    /// Wrap a module without a manifest.
    pub fn legacy(module: impl KernelModule + 'static) -> Self {
        Self::Legacy(Rc::new(module))
    }

    /// Wrap a module with its manifest.
    pub fn declared(manifest: ModuleManifest, module: impl KernelModule + 'static) -> Self {
        Self::Declared {
            manifest,
            module: Rc::new(module),
        }
    }
}

impl fmt::Debug for RegistrationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(module) => f.debug_tuple("Legacy").field(&module.name()).finish(),
            Self::Declared { manifest, .. } => f
                .debug_struct("Declared")
                .field("manifest", &manifest.id)
                .finish(),
        }
    }
}

/// Lifecycle state of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Registered, not started.
    Registered,
    /// Start hook completed or in progress.
    Running,
    /// Stopped cleanly.
    Stopped,
    /// A hook failed.
    Error,
    /// Quarantined until reset.
    Isolated,
}

impl ModuleState {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Isolated => "isolated",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry view of one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    /// Module id.
    pub id: String,
    /// Current state.
    pub state: ModuleState,
    /// Manifest summary, if registered with one.
    pub manifest: Option<ManifestSummary>,
}

struct ModuleEntry {
    module: Rc<dyn KernelModule>,
    manifest: Option<ModuleManifest>,
    state: ModuleState,
    transitioning: bool,
    context: Option<ModuleContext>,
}

// ---------------------------------------------------------------------------
// ModuleLoader
// ---------------------------------------------------------------------------

/// Owns every registered module and drives its lifecycle.
pub struct ModuleLoader {
    bus: Rc<EventBus>,
    permissions: Rc<PermissionSystem>,
    schemas: Rc<SchemaRegistry>,
    scheduler: Rc<Scheduler>,
    modules: RefCell<IndexMap<String, ModuleEntry>>,
}

impl ModuleLoader {
    /// Create an empty loader.
    pub fn new(
        bus: Rc<EventBus>,
        permissions: Rc<PermissionSystem>,
        schemas: Rc<SchemaRegistry>,
        scheduler: Rc<Scheduler>,
    ) -> Self {
        Self {
            bus,
            permissions,
            schemas,
            scheduler,
            modules: RefCell::new(IndexMap::new()),
        }
    }

    /// Register a module. With a manifest, the manifest is fully validated
    /// before permissions are granted or schemas declared.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] for an invalid, reserved or
    /// duplicate name and [`KernelError::Manifest`] for a bad manifest.
    pub fn register(&self, request: RegistrationRequest) -> Result<(), KernelError> {
        let (module, manifest) = match request {
            RegistrationRequest::Legacy(module) => (module, None),
            RegistrationRequest::Declared { manifest, module } => (module, Some(manifest)),
        };
        let id = module.name().to_owned();
        if !is_valid_name(&id) {
            return Err(KernelError::ModuleLifecycle(format!(
                "module name \"{id}\" violates naming contract"
            )));
        }
        if id == KERNEL_SOURCE {
            return Err(KernelError::ModuleLifecycle(
                "module name \"kernel\" is reserved".to_owned(),
            ));
        }
        if self.modules.borrow().contains_key(&id) {
            return Err(KernelError::ModuleLifecycle(format!(
                "module \"{id}\" is already registered"
            )));
        }

        let granted = match &manifest {
            Some(manifest) => {
                let granted = validate_manifest(manifest, &self.bus)?;
                if manifest.id != id {
                    let err = ManifestError::IdMismatch {
                        manifest_id: manifest.id.clone(),
                        module_name: id.clone(),
                    };
                    report_invalid(&self.bus, &manifest.id, &err);
                    return Err(err.into());
                }
                granted
            }
            None => Vec::new(),
        };

        if !granted.is_empty() {
            self.permissions.grant(&id, &granted)?;
        }
        if let Some(manifest) = &manifest {
            self.schemas.register_declarations(&id, &manifest.schemas);
        }
        self.modules.borrow_mut().insert(
            id.clone(),
            ModuleEntry {
                module,
                manifest,
                state: ModuleState::Registered,
                transitioning: false,
                context: None,
            },
        );
        info!(module = %id, permissions = granted.len(), "module registered");
        self.publish_transition(&id, "unregistered", ModuleState::Registered, "register");
        Ok(())
    }

    /// Start a registered module as the kernel.
    ///
    /// # Errors
    ///
    /// See [`ModuleLoader::start_with`].
    pub fn start(&self, id: &str) -> Result<ModuleState, KernelError> {
        self.start_with(id, None)
    }

    /// Start a registered module. `requested_by` other than the kernel or the
    /// module itself needs `kernel.control`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] for an unknown module, a
    /// state other than `registered`, or a failing start hook, and
    /// [`KernelError::Permission`] for an unauthorised requester.
    pub fn start_with(&self, id: &str, requested_by: Option<&str>) -> Result<ModuleState, KernelError> {
        self.ensure_known(id)?;
        self.authorize(id, requested_by, "module.start")?;
        let (module, ctx) = {
            let mut modules = self.modules.borrow_mut();
            let entry = modules
                .get_mut(id)
                .ok_or_else(|| unknown_module(id))?;
            if entry.transitioning {
                return Err(mid_transition(id));
            }
            if entry.state != ModuleState::Registered {
                return Err(KernelError::ModuleLifecycle(format!(
                    "cannot start module \"{id}\" from state {}",
                    entry.state
                )));
            }
            let ctx = ModuleContext::new(id, &self.bus, &self.scheduler);
            entry.context = Some(ctx.clone());
            (Rc::clone(&entry.module), ctx)
        };

        self.transition(id, ModuleState::Running, "start");
        info!(module = id, "starting module");
        if let Err(err) = module.start(&ctx) {
            warn!(module = id, error = %err, "module start hook failed");
            self.report_module_error(id, "start", &err);
            if self.state(id) == Some(ModuleState::Running) {
                self.set_transitioning(id, true);
                self.teardown(id, &ctx, "start_failed");
                self.transition(id, ModuleState::Error, "start_failed");
                self.set_transitioning(id, false);
            }
            return Err(KernelError::ModuleLifecycle(format!(
                "module \"{id}\" failed to start: {err:#}"
            )));
        }
        Ok(self.state(id).unwrap_or(ModuleState::Running))
    }

    /// Stop a running module. Teardown always runs; a failing stop hook
    /// leaves the module in `error`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] for an unknown module, a
    /// module that is not running or mid-transition, or a failing stop hook,
    /// and [`KernelError::Permission`] for an unauthorised requester.
    pub fn stop(&self, id: &str, reason: &str, requested_by: Option<&str>) -> Result<ModuleState, KernelError> {
        self.ensure_known(id)?;
        self.authorize(id, requested_by, "module.stop")?;
        let (module, ctx) = self.begin_shutdown(id)?;
        let hook = self.shutdown(id, &module, &ctx, reason);
        let next = if hook.is_err() {
            ModuleState::Error
        } else {
            ModuleState::Stopped
        };
        self.transition(id, next, reason);
        self.set_transitioning(id, false);
        match hook {
            Ok(()) => Ok(next),
            Err(err) => Err(KernelError::ModuleLifecycle(format!(
                "module \"{id}\" failed to stop cleanly: {err:#}"
            ))),
        }
    }

    /// Quarantine a module, stopping it first if it is running. Stop hook
    /// failures are reported but do not prevent isolation.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] for an unknown, already
    /// isolated or mid-transition module, and [`KernelError::Permission`]
    /// for an unauthorised requester.
    pub fn isolate(&self, id: &str, reason: &str, requested_by: Option<&str>) -> Result<ModuleState, KernelError> {
        self.ensure_known(id)?;
        self.authorize(id, requested_by, "module.isolate")?;
        let (state, transitioning) = self.entry_status(id)?;
        if transitioning {
            return Err(mid_transition(id));
        }
        match state {
            ModuleState::Isolated => {
                return Err(KernelError::ModuleLifecycle(format!(
                    "module \"{id}\" is already isolated"
                )));
            }
            ModuleState::Running => {
                let (module, ctx) = self.begin_shutdown(id)?;
                if self.shutdown(id, &module, &ctx, reason).is_err() {
                    self.transition(id, ModuleState::Error, reason);
                }
            }
            _ => self.set_transitioning(id, true),
        }
        self.transition(id, ModuleState::Isolated, reason);
        self.set_transitioning(id, false);
        warn!(module = id, reason, "module isolated");
        Ok(ModuleState::Isolated)
    }

    /// Return an isolated or failed module to `registered`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] for an unknown module or any
    /// other state, and [`KernelError::Permission`] for an unauthorised
    /// requester.
    pub fn reset(&self, id: &str, reason: &str, requested_by: Option<&str>) -> Result<ModuleState, KernelError> {
        self.ensure_known(id)?;
        self.authorize(id, requested_by, "module.reset")?;
        {
            let mut modules = self.modules.borrow_mut();
            let entry = modules
                .get_mut(id)
                .ok_or_else(|| unknown_module(id))?;
            if entry.transitioning {
                return Err(mid_transition(id));
            }
            if !matches!(entry.state, ModuleState::Isolated | ModuleState::Error) {
                return Err(KernelError::ModuleLifecycle(format!(
                    "cannot reset module \"{id}\" from state {}",
                    entry.state
                )));
            }
            entry.context = None;
        }
        self.transition(id, ModuleState::Registered, reason);
        info!(module = id, reason, "module reset");
        Ok(ModuleState::Registered)
    }

    /// Current state of `id`.
    pub fn state(&self, id: &str) -> Option<ModuleState> {
        self.modules.borrow().get(id).map(|entry| entry.state)
    }

    /// Registered module ids in registration order.
    pub fn module_ids(&self) -> Vec<String> {
        self.modules.borrow().keys().cloned().collect()
    }

    /// Resources currently held by `id`'s context.
    pub fn resource_counts(&self, id: &str) -> Option<ResourceCounts> {
        self.modules
            .borrow()
            .get(id)
            .map(|entry| entry.context.as_ref().map(ModuleContext::resource_counts).unwrap_or_default())
    }

    /// Registry view in registration order.
    pub fn snapshot(&self) -> Vec<ModuleInfo> {
        self.modules
            .borrow()
            .iter()
            .map(|(id, entry)| ModuleInfo {
                id: id.clone(),
                state: entry.state,
                manifest: entry.manifest.as_ref().map(ModuleManifest::summary),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn ensure_known(&self, id: &str) -> Result<(), KernelError> {
        if self.modules.borrow().contains_key(id) {
            Ok(())
        } else {
            Err(unknown_module(id))
        }
    }

    fn authorize(&self, id: &str, requested_by: Option<&str>, action: &str) -> Result<(), KernelError> {
        match requested_by {
            None => Ok(()),
            Some(source) if source == KERNEL_SOURCE || source == id => Ok(()),
            Some(source) => self.permissions.assert(
                source,
                Permission::KernelControl,
                &PermissionContext::new(action).with_target(id),
            ),
        }
    }

    fn entry_status(&self, id: &str) -> Result<(ModuleState, bool), KernelError> {
        self.modules
            .borrow()
            .get(id)
            .map(|entry| (entry.state, entry.transitioning))
            .ok_or_else(|| unknown_module(id))
    }

    /// Check the module is running and idle, then mark it transitioning.
    fn begin_shutdown(&self, id: &str) -> Result<(Rc<dyn KernelModule>, ModuleContext), KernelError> {
        let mut modules = self.modules.borrow_mut();
        let entry = modules
            .get_mut(id)
            .ok_or_else(|| unknown_module(id))?;
        if entry.transitioning {
            return Err(mid_transition(id));
        }
        if entry.state != ModuleState::Running {
            return Err(KernelError::ModuleLifecycle(format!(
                "module \"{id}\" is not running (state {})",
                entry.state
            )));
        }
        let ctx = entry
            .context
            .clone()
            .unwrap_or_else(|| ModuleContext::new(id, &self.bus, &self.scheduler));
        entry.transitioning = true;
        Ok((Rc::clone(&entry.module), ctx))
    }

    fn shutdown(
        &self,
        id: &str,
        module: &Rc<dyn KernelModule>,
        ctx: &ModuleContext,
        reason: &str,
    ) -> anyhow::Result<()> {
        info!(module = id, reason, "stopping module");
        let hook = module.stop(ctx);
        if let Err(err) = &hook {
            warn!(module = id, error = %err, "module stop hook failed");
            self.report_module_error(id, "stop", err);
        }
        self.teardown(id, ctx, reason);
        hook
    }

    fn teardown(&self, id: &str, ctx: &ModuleContext, reason: &str) {
        let drained = ctx.revoke_and_drain();

        let listeners_removed = drained
            .subscriptions
            .iter()
            .filter(|subscription| subscription.unsubscribe())
            .count();

        let timers_cleared = drained
            .timers
            .iter()
            .filter(|timer| self.scheduler.cancel(timer.task()))
            .count()
            .saturating_add(self.bus.discard_batches_for(id));

        let mut disposers_run: usize = 0;
        let mut dispose_errors: usize = 0;
        for (index, dispose) in drained.disposers.into_iter().enumerate().rev() {
            match dispose() {
                Ok(()) => disposers_run = disposers_run.saturating_add(1),
                Err(err) => {
                    dispose_errors = dispose_errors.saturating_add(1);
                    warn!(module = id, index, error = %err, "dispose callback failed");
                    self.bus.publish_kernel(
                        "diagnostic:dispose_error",
                        json!({ "moduleId": id, "index": index, "error": format!("{err:#}") }),
                    );
                }
            }
        }

        let mut tasks_leaked: usize = 0;
        for (label, handle) in drained.tasks {
            if handle.is_finished() {
                continue;
            }
            handle.abort();
            tasks_leaked = tasks_leaked.saturating_add(1);
            warn!(module = id, task = %label, "tracked task still pending at teardown");
            self.bus.publish_kernel(
                "diagnostic:task_leak",
                json!({ "moduleId": id, "label": label }),
            );
        }

        info!(
            module = id,
            reason,
            listeners_removed,
            timers_cleared,
            disposers_run,
            dispose_errors,
            tasks_leaked,
            "module teardown complete"
        );
        self.bus.publish_kernel(
            "diagnostic:teardown_cleanup",
            json!({
                "moduleId": id,
                "reason": reason,
                "listenersRemoved": listeners_removed,
                "timersCleared": timers_cleared,
                "disposersRun": disposers_run,
                "disposeErrors": dispose_errors,
                "tasksLeaked": tasks_leaked,
            }),
        );
    }

    fn transition(&self, id: &str, next: ModuleState, reason: &str) {
        let prev = {
            let mut modules = self.modules.borrow_mut();
            let Some(entry) = modules.get_mut(id) else {
                return;
            };
            std::mem::replace(&mut entry.state, next)
        };
        self.publish_transition(id, prev.as_str(), next, reason);
    }

    fn publish_transition(&self, id: &str, prev: &str, next: ModuleState, reason: &str) {
        info!(module = id, from = prev, to = next.as_str(), reason, "module lifecycle transition");
        self.bus.publish_kernel(
            LIFECYCLE_EVENT,
            json!({
                "moduleId": id,
                "prevState": prev,
                "nextState": next.as_str(),
                "reason": reason,
                "timestamp": self.bus.clock().now_ms(),
            }),
        );
    }

    fn set_transitioning(&self, id: &str, value: bool) {
        if let Some(entry) = self.modules.borrow_mut().get_mut(id) {
            entry.transitioning = value;
        }
    }

    fn report_module_error(&self, id: &str, phase: &str, err: &anyhow::Error) {
        self.bus.publish_kernel(
            "diagnostic:module_error",
            json!({ "moduleId": id, "phase": phase, "error": format!("{err:#}") }),
        );
    }
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("modules", &self.module_ids())
            .finish()
    }
}

fn unknown_module(id: &str) -> KernelError {
    KernelError::ModuleLifecycle(format!("unknown module \"{id}\""))
}

fn mid_transition(id: &str) -> KernelError {
    KernelError::ModuleLifecycle(format!("module \"{id}\" is mid-transition"))
}
