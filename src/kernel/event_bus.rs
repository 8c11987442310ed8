//! Mediated event bus: naming contract, reserved namespaces, schema
//! validation, storm and signal-rate guards, optional backpressure with
//! batching, bounded history and listener caps.
//!
//! Delivery never holds an internal borrow while user code runs, so
//! listeners may emit, subscribe or unsubscribe re-entrantly. Listeners
//! removed during a delivery pass are not invoked for the rest of it.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::{BusConfig, DropStrategy};
use crate::kernel::clock::Clock;
use crate::kernel::error::KernelError;
use crate::kernel::permission::{Permission, PermissionContext};
use crate::kernel::scheduler::{Scheduler, TaskId};
use crate::kernel::schema::SchemaValidator;
use crate::kernel::{is_valid_name, KERNEL_SOURCE};

/// Records retained in history before the oldest is evicted.
pub const MAX_HISTORY: usize = 500;
/// Listener cap for a single event name.
pub const MAX_LISTENERS_PER_EVENT: usize = 25;
/// Listener cap across the whole bus.
pub const MAX_TOTAL_LISTENERS: usize = 200;
/// Listener cap for a single source.
pub const MAX_LISTENERS_PER_SOURCE: usize = 50;
/// Sliding window for the storm and signal-rate guards.
pub const STORM_WINDOW_MS: u64 = 1000;
/// Emits allowed inside the storm window across all sources.
pub const MAX_EMITS_PER_WINDOW: usize = 100;
/// Emits a single source may make inside the window before a
/// `diagnostic:signal_rate` record is published.
pub const MAX_SIGNALS_PER_WINDOW: usize = 60;

const LISTENER_ERROR_EVENT: &str = "diagnostic:listener_error";

/// Callback invoked with the payload of each delivered event.
pub type ListenerFn = Rc<dyn Fn(&Value) -> anyhow::Result<()>>;

/// Immutable record of a delivered event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Event name.
    pub name: String,
    /// Event payload.
    pub payload: Value,
    /// Delivery time in milliseconds.
    pub timestamp: u64,
    /// Emitting source id.
    pub source: String,
}

/// Which event a listener is attached to and who attached it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerMeta {
    /// Event name listened to.
    pub event_name: String,
    /// Registering source id.
    pub source: String,
}

/// Gate consulted for `system:` and `diagnostic:` emits from non-kernel
/// sources.
pub trait PermissionChecker {
    /// Fail unless `module_id` holds `permission`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] when the grant is missing.
    fn assert_permission(
        &self,
        module_id: &str,
        permission: Permission,
        context: &PermissionContext,
    ) -> Result<(), KernelError>;
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerId(u64);

/// Handle returned by [`EventBus::listen`]. Clones share state, so the
/// first `unsubscribe` through any clone wins.
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: ListenerId,
    active: Rc<Cell<bool>>,
}

impl Subscription {
    /// Remove the listener. Returns `true` only for the call that removed it.
    pub fn unsubscribe(&self) -> bool {
        if !self.active.replace(false) {
            return false;
        }
        self.bus
            .upgrade()
            .is_some_and(|bus| bus.remove_listener(self.id))
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Listener {
    id: ListenerId,
    handler: ListenerFn,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<String, Vec<Listener>>,
    meta: HashMap<ListenerId, ListenerMeta>,
    per_source: HashMap<String, usize>,
    total: usize,
    next_id: u64,
}

struct QueuedEvent {
    name: String,
    payload: Value,
    source: String,
}

struct PendingBatch {
    name: String,
    source: String,
    payloads: Vec<Value>,
    task: TaskId,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// The only channel between modules.
pub struct EventBus {
    me: Weak<EventBus>,
    config: BusConfig,
    clock: Rc<dyn Clock>,
    scheduler: Rc<Scheduler>,
    registry: RefCell<Registry>,
    history: RefCell<VecDeque<EventRecord>>,
    emit_window: RefCell<VecDeque<u64>>,
    source_windows: RefCell<HashMap<String, VecDeque<u64>>>,
    schemas: RefCell<HashMap<String, SchemaValidator>>,
    queue: RefCell<VecDeque<QueuedEvent>>,
    flush_task: Cell<Option<TaskId>>,
    batches: RefCell<HashMap<String, PendingBatch>>,
    permissions: RefCell<Option<Weak<dyn PermissionChecker>>>,
}

impl EventBus {
    /// Create a bus. Queue and batch sizes below 1 are raised to 1.
    pub fn new(mut config: BusConfig, scheduler: Rc<Scheduler>) -> Rc<Self> {
        config.backpressure.max_queue_size = config.backpressure.max_queue_size.max(1);
        config.backpressure.max_batch_size = config.backpressure.max_batch_size.max(1);
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            clock: scheduler.clock(),
            scheduler,
            registry: RefCell::new(Registry::default()),
            history: RefCell::new(VecDeque::with_capacity(MAX_HISTORY)),
            emit_window: RefCell::new(VecDeque::new()),
            source_windows: RefCell::new(HashMap::new()),
            schemas: RefCell::new(HashMap::new()),
            queue: RefCell::new(VecDeque::new()),
            flush_task: Cell::new(None),
            batches: RefCell::new(HashMap::new()),
            permissions: RefCell::new(None),
        })
    }

    /// The clock used for timestamps and windows.
    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock)
    }

    /// Install the gate for reserved namespaces. Without one, non-kernel
    /// `system:`/`diagnostic:` emits are refused.
    pub fn set_permission_checker(&self, checker: Weak<dyn PermissionChecker>) {
        *self.permissions.borrow_mut() = Some(checker);
    }

    // -----------------------------------------------------------------------
    // Emit
    // -----------------------------------------------------------------------

    /// Publish `payload` under `name` on behalf of `source`.
    ///
    /// Returns `Ok(())` both when the event was delivered (or queued) and
    /// when the storm guard silently dropped a non-kernel emit.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] for a bad name, a missing
    /// source, a `kernel:` emit from a module, a schema violation, or a storm
    /// triggered by the kernel itself. Returns [`KernelError::Permission`]
    /// for a reserved emit without `event.emit_reserved`.
    pub fn emit(&self, name: &str, payload: Value, source: &str) -> Result<(), KernelError> {
        validate_name(name)?;
        require_source(source, "emit")?;
        self.check_namespace(name, source)?;
        if self.config.enable_schema_validation {
            self.validate_payload(name, &payload, source)?;
        }
        if !self.admit(source)? {
            return Ok(());
        }
        self.observe_signal_rate(source);

        debug!(event = name, source, "event emitted");
        if self.config.backpressure.enabled {
            self.enqueue(QueuedEvent {
                name: name.to_owned(),
                payload,
                source: source.to_owned(),
            });
        } else {
            self.deliver(name, payload, source);
        }
        Ok(())
    }

    /// Collect `payload` into the pending batch for `(source, name)`. The
    /// batch is queued as one event carrying the ordered payload array once
    /// `window_ms` (default: configured batching window) elapses.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] when backpressure is disabled,
    /// the name is invalid or the source is missing, and any namespace error
    /// [`EventBus::emit`] would raise.
    pub fn emit_batched(
        &self,
        name: &str,
        payload: Value,
        source: &str,
        window_ms: Option<u64>,
    ) -> Result<(), KernelError> {
        if !self.config.backpressure.enabled {
            return Err(KernelError::EventContract(
                "emit_batched requires backpressure to be enabled".to_owned(),
            ));
        }
        validate_name(name)?;
        require_source(source, "emit_batched")?;
        self.check_namespace(name, source)?;

        let key = format!("{source}|{name}");
        let max_batch = self.config.backpressure.max_batch_size;
        let full = self
            .batches
            .borrow()
            .get(&key)
            .map(|batch| batch.payloads.len() >= max_batch);
        match full {
            Some(true) => {
                warn!(event = name, source, max_batch, "batch full, dropping payload");
                self.publish_kernel(
                    "diagnostic:backpressure_overflow",
                    json!({
                        "event": name,
                        "source": source,
                        "reason": "batch_full",
                        "maxBatchSize": max_batch,
                    }),
                );
            }
            Some(false) => {
                if let Some(batch) = self.batches.borrow_mut().get_mut(&key) {
                    batch.payloads.push(payload);
                }
            }
            None => {
                let window = window_ms.unwrap_or(self.config.backpressure.batching_window_ms);
                let weak = self.me.clone();
                let flush_key = key.clone();
                let task = self.scheduler.schedule(window, move || {
                    if let Some(bus) = weak.upgrade() {
                        bus.flush_batch(&flush_key);
                    }
                });
                self.batches.borrow_mut().insert(
                    key,
                    PendingBatch {
                        name: name.to_owned(),
                        source: source.to_owned(),
                        payloads: vec![payload],
                        task,
                    },
                );
            }
        }
        Ok(())
    }

    /// Record and deliver a kernel-originated event synchronously. Skips the
    /// namespace gate, schema validation, the storm and signal-rate windows
    /// and the queue.
    pub fn publish_kernel(&self, name: &str, payload: Value) {
        self.deliver(name, payload, KERNEL_SOURCE);
    }

    /// Cancel every open batch window owned by `source` and drop the payloads
    /// collected so far. Returns the number of batches discarded.
    pub fn discard_batches_for(&self, source: &str) -> usize {
        let discarded: Vec<PendingBatch> = {
            let mut batches = self.batches.borrow_mut();
            let keys: Vec<String> = batches
                .iter()
                .filter(|(_, batch)| batch.source == source)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| batches.remove(key)).collect()
        };
        for batch in &discarded {
            self.scheduler.cancel(batch.task);
            debug!(event = %batch.name, source, size = batch.payloads.len(), "batch discarded");
        }
        discarded.len()
    }

    /// Number of sources with emits inside the current signal-rate window.
    pub fn signal_window_count(&self) -> usize {
        self.source_windows.borrow().len()
    }

    /// Whether `source` has a batch window open.
    pub fn has_pending_batches(&self, source: &str) -> bool {
        self.batches.borrow().values().any(|batch| batch.source == source)
    }

    /// Deliver everything queued so far, in arrival order. Returns the number
    /// of events delivered.
    pub fn flush_queue(&self) -> usize {
        let pending: Vec<QueuedEvent> = self.queue.borrow_mut().drain(..).collect();
        let delivered = pending.len();
        for event in pending {
            self.deliver(&event.name, event.payload, &event.source);
        }
        delivered
    }

    // -----------------------------------------------------------------------
    // Listen
    // -----------------------------------------------------------------------

    /// Register `handler` for `name` on behalf of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] for a bad name, a missing
    /// source, or when the total, per-event or per-source cap is reached.
    pub fn listen(
        &self,
        name: &str,
        source: &str,
        handler: impl Fn(&Value) -> anyhow::Result<()> + 'static,
    ) -> Result<Subscription, KernelError> {
        validate_name(name)?;
        require_source(source, "listen")?;

        let mut registry = self.registry.borrow_mut();
        if registry.total >= MAX_TOTAL_LISTENERS {
            return Err(KernelError::EventContract(format!(
                "listen exceeds max total listeners ({MAX_TOTAL_LISTENERS})"
            )));
        }
        let for_event = registry.handlers.get(name).map_or(0, Vec::len);
        if for_event >= MAX_LISTENERS_PER_EVENT {
            return Err(KernelError::EventContract(format!(
                "listen exceeds max listeners for \"{name}\" ({MAX_LISTENERS_PER_EVENT})"
            )));
        }
        let for_source = registry.per_source.get(source).copied().unwrap_or(0);
        if for_source >= MAX_LISTENERS_PER_SOURCE {
            return Err(KernelError::EventContract(format!(
                "listen exceeds max listeners for source \"{source}\" ({MAX_LISTENERS_PER_SOURCE})"
            )));
        }

        registry.next_id = registry.next_id.saturating_add(1);
        let id = ListenerId(registry.next_id);
        registry
            .handlers
            .entry(name.to_owned())
            .or_default()
            .push(Listener {
                id,
                handler: Rc::new(handler),
            });
        registry.meta.insert(
            id,
            ListenerMeta {
                event_name: name.to_owned(),
                source: source.to_owned(),
            },
        );
        registry
            .per_source
            .insert(source.to_owned(), for_source.saturating_add(1));
        registry.total = registry.total.saturating_add(1);
        drop(registry);

        debug!(event = name, source, "listener registered");
        Ok(Subscription {
            bus: self.me.clone(),
            id,
            active: Rc::new(Cell::new(true)),
        })
    }

    // -----------------------------------------------------------------------
    // Schemas
    // -----------------------------------------------------------------------

    /// Bind `validator` to an event name or `prefix:*` pattern.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] for a malformed key and
    /// [`KernelError::Permission`] when a non-kernel source lacks
    /// `schema.register`.
    pub fn register_schema(
        &self,
        key: &str,
        source: &str,
        validator: SchemaValidator,
    ) -> Result<(), KernelError> {
        let base = key.strip_suffix(":*").unwrap_or(key);
        if !is_valid_name(base) {
            return Err(KernelError::EventContract(format!(
                "schema key \"{key}\" violates naming contract"
            )));
        }
        require_source(source, "register_schema")?;
        if source != KERNEL_SOURCE {
            self.assert_permission(
                source,
                Permission::SchemaRegister,
                &PermissionContext::new("schema.register").with_target(key),
            )?;
        }
        self.schemas.borrow_mut().insert(key.to_owned(), validator);
        info!(key, source, "schema validator registered");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Chronological copy of the retained history.
    pub fn history(&self) -> Vec<EventRecord> {
        self.history.borrow().iter().cloned().collect()
    }

    /// Last `n` history records, oldest first.
    pub fn history_tail(&self, n: usize) -> Vec<EventRecord> {
        let history = self.history.borrow();
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of retained history records.
    pub fn history_len(&self) -> usize {
        self.history.borrow().len()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.registry.borrow().total
    }

    /// Number of listeners registered by `source`.
    pub fn listener_count_for(&self, source: &str) -> usize {
        self.registry
            .borrow()
            .per_source
            .get(source)
            .copied()
            .unwrap_or(0)
    }

    /// Number of events waiting in the backpressure queue.
    pub fn queue_len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Number of bound schema validators.
    pub fn schema_count(&self) -> usize {
        self.schemas.borrow().len()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn check_namespace(&self, name: &str, source: &str) -> Result<(), KernelError> {
        if source == KERNEL_SOURCE {
            return Ok(());
        }
        if name.starts_with("kernel:") {
            return Err(KernelError::EventContract(format!(
                "event \"{name}\" is reserved for the kernel"
            )));
        }
        if name.starts_with("system:") || name.starts_with("diagnostic:") {
            self.assert_permission(
                source,
                Permission::EmitReserved,
                &PermissionContext::new("event.emit").with_event(name),
            )?;
        }
        Ok(())
    }

    fn assert_permission(
        &self,
        source: &str,
        permission: Permission,
        context: &PermissionContext,
    ) -> Result<(), KernelError> {
        let checker = self.permissions.borrow().as_ref().and_then(Weak::upgrade);
        match checker {
            Some(checker) => checker.assert_permission(source, permission, context),
            None => Err(KernelError::Permission(format!(
                "no permission checker installed; \"{source}\" cannot {}",
                context.action
            ))),
        }
    }

    fn validate_payload(&self, name: &str, payload: &Value, source: &str) -> Result<(), KernelError> {
        let validator = {
            let schemas = self.schemas.borrow();
            schemas
                .get(name)
                .or_else(|| schemas.get(&format!("{source}:*")))
                .or_else(|| schemas.get("kernel:*"))
                .cloned()
        };
        let Some(validator) = validator else {
            return Ok(());
        };
        if let Err(reason) = validator(payload) {
            warn!(event = name, source, %reason, "schema violation");
            self.publish_kernel(
                "diagnostic:schema_violation",
                json!({ "event": name, "source": source, "error": reason }),
            );
            return Err(KernelError::EventContract(format!(
                "payload for \"{name}\" failed schema validation: {reason}"
            )));
        }
        Ok(())
    }

    /// Storm guard. `Ok(false)` means the emit was dropped.
    fn admit(&self, source: &str) -> Result<bool, KernelError> {
        let now = self.clock.now_ms();
        let count = {
            let mut window = self.emit_window.borrow_mut();
            window.push_back(now);
            prune_window(&mut window, now);
            window.len()
        };
        if count <= MAX_EMITS_PER_WINDOW {
            return Ok(true);
        }
        self.publish_kernel(
            "diagnostic:event_storm",
            json!({ "count": count, "windowMs": STORM_WINDOW_MS, "source": source }),
        );
        if source == KERNEL_SOURCE {
            return Err(KernelError::EventContract(format!(
                "storm detected: {count} emits in {STORM_WINDOW_MS}ms"
            )));
        }
        warn!(source, count, "event storm, dropping emit");
        Ok(false)
    }

    fn observe_signal_rate(&self, source: &str) {
        let now = self.clock.now_ms();
        let (count, crossed) = {
            let mut windows = self.source_windows.borrow_mut();
            windows.retain(|_, window| {
                prune_window(window, now);
                !window.is_empty()
            });
            let window = windows.entry(source.to_owned()).or_default();
            let before = window.len();
            window.push_back(now);
            (
                window.len(),
                before <= MAX_SIGNALS_PER_WINDOW && window.len() > MAX_SIGNALS_PER_WINDOW,
            )
        };
        if crossed {
            warn!(source, count, "signal rate exceeded");
            self.publish_kernel(
                "diagnostic:signal_rate",
                json!({ "source": source, "count": count, "windowMs": STORM_WINDOW_MS }),
            );
        }
    }

    fn enqueue(&self, event: QueuedEvent) {
        let backpressure = &self.config.backpressure;
        let dropped = {
            let mut queue = self.queue.borrow_mut();
            if queue.len() < backpressure.max_queue_size {
                queue.push_back(event);
                None
            } else {
                match backpressure.drop_strategy {
                    DropStrategy::DropOldest => {
                        let oldest = queue.pop_front();
                        queue.push_back(event);
                        oldest
                    }
                    DropStrategy::DropNewest => Some(event),
                }
            }
        };
        if let Some(dropped) = dropped {
            warn!(
                event = %dropped.name,
                source = %dropped.source,
                strategy = backpressure.drop_strategy.as_str(),
                "backpressure queue overflow"
            );
            self.publish_kernel(
                "diagnostic:backpressure_overflow",
                json!({
                    "event": dropped.name,
                    "source": dropped.source,
                    "strategy": backpressure.drop_strategy.as_str(),
                    "maxQueueSize": backpressure.max_queue_size,
                }),
            );
        }
        self.schedule_flush();
    }

    fn schedule_flush(&self) {
        if self.flush_task.get().is_some() {
            return;
        }
        let weak = self.me.clone();
        let task = self.scheduler.schedule(0, move || {
            if let Some(bus) = weak.upgrade() {
                bus.flush_task.set(None);
                bus.flush_queue();
            }
        });
        self.flush_task.set(Some(task));
    }

    fn flush_batch(&self, key: &str) {
        let Some(batch) = self.batches.borrow_mut().remove(key) else {
            return;
        };
        debug!(event = %batch.name, source = %batch.source, size = batch.payloads.len(), "batch flushed");
        self.enqueue(QueuedEvent {
            name: batch.name,
            payload: Value::Array(batch.payloads),
            source: batch.source,
        });
    }

    fn deliver(&self, name: &str, payload: Value, source: &str) {
        self.record(EventRecord {
            name: name.to_owned(),
            payload: payload.clone(),
            timestamp: self.clock.now_ms(),
            source: source.to_owned(),
        });

        let listeners: Vec<(ListenerId, ListenerFn)> = self
            .registry
            .borrow()
            .handlers
            .get(name)
            .map(|ls| ls.iter().map(|l| (l.id, Rc::clone(&l.handler))).collect())
            .unwrap_or_default();

        for (id, handler) in listeners {
            let owner = self.registry.borrow().meta.get(&id).map(|m| m.source.clone());
            let Some(owner) = owner else {
                continue;
            };
            if let Err(err) = handler(&payload) {
                warn!(event = name, source, listener = %owner, error = %err, "listener failed during delivery");
                if name != LISTENER_ERROR_EVENT {
                    self.publish_kernel(
                        LISTENER_ERROR_EVENT,
                        json!({
                            "event": name,
                            "source": source,
                            "listenerSource": owner,
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
    }

    fn record(&self, record: EventRecord) {
        let mut history = self.history.borrow_mut();
        history.push_back(record);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.borrow_mut();
        let Some(meta) = registry.meta.remove(&id) else {
            return false;
        };
        if let Some(listeners) = registry.handlers.get_mut(&meta.event_name) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                registry.handlers.remove(&meta.event_name);
            }
        }
        let remaining = registry
            .per_source
            .get(&meta.source)
            .copied()
            .unwrap_or(1)
            .saturating_sub(1);
        if remaining == 0 {
            registry.per_source.remove(&meta.source);
        } else {
            registry.per_source.insert(meta.source.clone(), remaining);
        }
        registry.total = registry.total.saturating_sub(1);
        drop(registry);
        debug!(event = %meta.event_name, source = %meta.source, "listener removed");
        true
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("history", &self.history_len())
            .field("queued", &self.queue_len())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), KernelError> {
    if name.is_empty() {
        return Err(KernelError::EventContract(
            "event name must not be empty".to_owned(),
        ));
    }
    if !is_valid_name(name) {
        return Err(KernelError::EventContract(format!(
            "event name \"{name}\" violates naming contract"
        )));
    }
    Ok(())
}

fn require_source(source: &str, operation: &str) -> Result<(), KernelError> {
    if source.is_empty() {
        return Err(KernelError::EventContract(format!(
            "{operation} requires a source"
        )));
    }
    if !is_valid_name(source) {
        return Err(KernelError::EventContract(format!(
            "{operation} source \"{source}\" violates naming contract"
        )));
    }
    Ok(())
}

fn prune_window(window: &mut VecDeque<u64>, now: u64) {
    while window
        .front()
        .is_some_and(|t| now.saturating_sub(*t) > STORM_WINDOW_MS)
    {
        window.pop_front();
    }
}
