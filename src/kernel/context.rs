//! Capability handle given to a module while it runs.
//!
//! Every listener, timer, dispose callback and tracked task created through a
//! [`ModuleContext`] is recorded against the module so the loader can
//! reclaim it on teardown. Once the module is torn down the context is
//! revoked and every further call fails.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::kernel::error::KernelError;
use crate::kernel::event_bus::{EventBus, Subscription};
use crate::kernel::scheduler::{Scheduler, TaskId};

/// Cleanup callback run on teardown, most recent first.
pub type DisposeFn = Box<dyn FnOnce() -> anyhow::Result<()>>;

/// Handle for a timeout or interval created through a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(TaskId);

/// Counts of resources a module currently holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounts {
    /// Active listeners.
    pub listeners: usize,
    /// Pending timeouts and intervals.
    pub timers: usize,
    /// Registered dispose callbacks.
    pub disposers: usize,
    /// Unsettled tracked tasks.
    pub tasks: usize,
}

/// Everything a module registered, ready to be reclaimed.
#[derive(Default)]
pub(crate) struct ModuleResources {
    subscriptions: Vec<Subscription>,
    timers: Vec<TimerHandle>,
    disposers: Vec<DisposeFn>,
    tasks: BTreeMap<String, JoinHandle<()>>,
}

/// Resources taken out of a revoked context for teardown.
pub(crate) struct DrainedResources {
    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) timers: Vec<TimerHandle>,
    pub(crate) disposers: Vec<DisposeFn>,
    pub(crate) tasks: BTreeMap<String, JoinHandle<()>>,
}

/// Module-scoped view of the bus and scheduler.
#[derive(Clone)]
pub struct ModuleContext {
    module_id: Rc<str>,
    bus: Weak<EventBus>,
    scheduler: Weak<Scheduler>,
    resources: Rc<RefCell<ModuleResources>>,
    revoked: Rc<Cell<bool>>,
}

impl ModuleContext {
    pub(crate) fn new(module_id: &str, bus: &Rc<EventBus>, scheduler: &Rc<Scheduler>) -> Self {
        Self {
            module_id: Rc::from(module_id),
            bus: Rc::downgrade(bus),
            scheduler: Rc::downgrade(scheduler),
            resources: Rc::new(RefCell::new(ModuleResources::default())),
            revoked: Rc::new(Cell::new(false)),
        }
    }

    /// Id of the module this context belongs to.
    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Whether the context still accepts calls.
    pub fn is_active(&self) -> bool {
        !self.revoked.get()
    }

    /// Emit on behalf of this module.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked, otherwise
    /// whatever [`EventBus::emit`] returns.
    pub fn emit(&self, name: &str, payload: Value) -> Result<(), KernelError> {
        self.bus()?.emit(name, payload, &self.module_id)
    }

    /// Batched emit on behalf of this module.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked, otherwise
    /// whatever [`EventBus::emit_batched`] returns.
    pub fn emit_batched(
        &self,
        name: &str,
        payload: Value,
        window_ms: Option<u64>,
    ) -> Result<(), KernelError> {
        self.bus()?
            .emit_batched(name, payload, &self.module_id, window_ms)
    }

    /// Listen on behalf of this module. The subscription is removed on
    /// teardown if the module has not removed it already.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked, otherwise
    /// whatever [`EventBus::listen`] returns.
    pub fn listen(
        &self,
        name: &str,
        handler: impl Fn(&Value) -> anyhow::Result<()> + 'static,
    ) -> Result<Subscription, KernelError> {
        let subscription = self.bus()?.listen(name, &self.module_id, handler)?;
        let mut resources = self.resources.borrow_mut();
        resources.subscriptions.retain(Subscription::is_active);
        resources.subscriptions.push(subscription.clone());
        Ok(subscription)
    }

    /// Run `callback` once after `delay_ms`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked.
    pub fn set_timeout(
        &self,
        delay_ms: u64,
        callback: impl FnOnce() + 'static,
    ) -> Result<TimerHandle, KernelError> {
        let scheduler = self.scheduler()?;
        let slot: Rc<Cell<Option<TaskId>>> = Rc::new(Cell::new(None));
        let fired = Rc::clone(&slot);
        let resources = Rc::downgrade(&self.resources);
        let task = scheduler.schedule(delay_ms, move || {
            if let (Some(resources), Some(task)) = (resources.upgrade(), fired.get()) {
                resources
                    .borrow_mut()
                    .timers
                    .retain(|t| *t != TimerHandle(task));
            }
            callback();
        });
        slot.set(Some(task));
        let handle = TimerHandle(task);
        self.resources.borrow_mut().timers.push(handle);
        Ok(handle)
    }

    /// Run `callback` every `every_ms` until cleared or torn down.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked.
    pub fn set_interval(
        &self,
        every_ms: u64,
        callback: impl Fn() + 'static,
    ) -> Result<TimerHandle, KernelError> {
        let scheduler = self.scheduler()?;
        let handle = TimerHandle(scheduler.schedule_repeating(every_ms, callback));
        self.resources.borrow_mut().timers.push(handle);
        Ok(handle)
    }

    /// Cancel a timer created through this context. Returns `false` if it
    /// already fired, was cleared, or belongs to another context.
    pub fn clear_timer(&self, handle: TimerHandle) -> bool {
        let owned = {
            let mut resources = self.resources.borrow_mut();
            let before = resources.timers.len();
            resources.timers.retain(|t| *t != handle);
            resources.timers.len() != before
        };
        owned
            && self
                .scheduler
                .upgrade()
                .is_some_and(|scheduler| scheduler.cancel(handle.0))
    }

    /// Register cleanup to run on teardown. Callbacks run in reverse order
    /// of registration; a failing callback does not stop the others.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked.
    pub fn on_dispose(
        &self,
        callback: impl FnOnce() -> anyhow::Result<()> + 'static,
    ) -> Result<(), KernelError> {
        self.ensure_active()?;
        self.resources
            .borrow_mut()
            .disposers
            .push(Box::new(callback));
        Ok(())
    }

    /// Run `future` on the kernel's local task set under `label`. The entry
    /// clears itself when the future completes; anything still pending at
    /// teardown is aborted and reported as leaked.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::ModuleLifecycle`] once revoked or when a task
    /// with the same label is still pending.
    pub fn track<F>(&self, label: &str, future: F) -> Result<(), KernelError>
    where
        F: Future<Output = ()> + 'static,
    {
        let scheduler = self.scheduler()?;
        if self.resources.borrow().tasks.contains_key(label) {
            return Err(KernelError::ModuleLifecycle(format!(
                "module \"{}\" already tracks a pending task \"{label}\"",
                self.module_id
            )));
        }
        let resources = Rc::downgrade(&self.resources);
        let key = label.to_owned();
        let handle = scheduler.spawn_local(async move {
            future.await;
            if let Some(resources) = resources.upgrade() {
                resources.borrow_mut().tasks.remove(&key);
            }
        });
        self.resources
            .borrow_mut()
            .tasks
            .insert(label.to_owned(), handle);
        Ok(())
    }

    /// Resources currently recorded against the module.
    pub fn resource_counts(&self) -> ResourceCounts {
        let resources = self.resources.borrow();
        ResourceCounts {
            listeners: resources
                .subscriptions
                .iter()
                .filter(|s| s.is_active())
                .count(),
            timers: resources.timers.len(),
            disposers: resources.disposers.len(),
            tasks: resources.tasks.len(),
        }
    }

    /// Revoke the context and hand everything it recorded to the caller.
    pub(crate) fn revoke_and_drain(&self) -> DrainedResources {
        self.revoked.set(true);
        let mut resources = self.resources.borrow_mut();
        DrainedResources {
            subscriptions: std::mem::take(&mut resources.subscriptions),
            timers: std::mem::take(&mut resources.timers),
            disposers: std::mem::take(&mut resources.disposers),
            tasks: std::mem::take(&mut resources.tasks),
        }
    }

    fn ensure_active(&self) -> Result<(), KernelError> {
        if self.revoked.get() {
            return Err(KernelError::ModuleLifecycle(format!(
                "context for module \"{}\" has been revoked",
                self.module_id
            )));
        }
        Ok(())
    }

    fn bus(&self) -> Result<Rc<EventBus>, KernelError> {
        self.ensure_active()?;
        self.bus.upgrade().ok_or_else(|| {
            KernelError::ModuleLifecycle("event bus has been dropped".to_owned())
        })
    }

    fn scheduler(&self) -> Result<Rc<Scheduler>, KernelError> {
        self.ensure_active()?;
        self.scheduler.upgrade().ok_or_else(|| {
            KernelError::ModuleLifecycle("scheduler has been dropped".to_owned())
        })
    }
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("module_id", &self.module_id)
            .field("active", &self.is_active())
            .field("resources", &self.resource_counts())
            .finish()
    }
}

impl TimerHandle {
    pub(crate) fn task(self) -> TaskId {
        self.0
    }
}
