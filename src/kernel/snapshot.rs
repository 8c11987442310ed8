//! Read-only aggregate view of kernel state, recomputed on every call.
//!
//! The snapshot is JSON-safe by construction and never includes cache
//! values or validator functions.

use std::collections::HashMap;
use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;

use crate::kernel::cache::CacheStore;
use crate::kernel::clock::Clock;
use crate::kernel::event_bus::{EventBus, EventRecord};
use crate::kernel::loader::{ModuleLoader, LIFECYCLE_EVENT};
use crate::kernel::manifest::ManifestSummary;
use crate::kernel::schema::{SchemaRegistry, SchemaSnapshot};
use crate::kernel::watchdog::{WatchdogCore, WatchdogSnapshot};

/// Snapshot format version.
pub const SNAPSHOT_VERSION: &str = "kernel-seed";

/// History records included in a snapshot.
pub const HISTORY_TAIL: usize = 50;

/// Full kernel view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelSnapshot {
    /// When and by what the snapshot was taken.
    pub meta: SnapshotMeta,
    /// Registered modules in registration order.
    pub modules: Vec<ModuleSnapshot>,
    /// Bus history tail and counters.
    pub event_bus: BusSnapshot,
    /// Schema declarations.
    pub schemas: SchemaSnapshot,
    /// Watchdog policy and stats, when a watchdog is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watchdog: Option<WatchdogSnapshot>,
    /// Cache size, when a cache is attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheSnapshot>,
}

/// Snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Time the snapshot was taken.
    pub timestamp: u64,
    /// Format version.
    pub version: String,
    /// Milliseconds since the snapshotter was created.
    pub uptime_ms: u64,
}

/// Most recent lifecycle transition of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleTransition {
    /// When it happened.
    pub timestamp: u64,
    /// State before.
    pub prev_state: String,
    /// State after.
    pub next_state: String,
    /// Why.
    pub reason: String,
}

/// One module in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSnapshot {
    /// Module id.
    pub id: String,
    /// Current state.
    pub state: String,
    /// Manifest summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest: Option<ManifestSummary>,
    /// Last transition still present in bus history.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_lifecycle_transition: Option<LifecycleTransition>,
}

/// Bus view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusSnapshot {
    /// Last [`HISTORY_TAIL`] records, oldest first.
    pub history_tail: Vec<EventRecord>,
    /// Counters.
    pub counts: BusCounts,
}

/// Bus counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusCounts {
    /// Records retained in history.
    pub total_history: usize,
    /// Registered listeners.
    pub listener_count: usize,
    /// Events waiting in the backpressure queue.
    pub queued: usize,
    /// Bound schema validators.
    pub schemas_registered: usize,
}

/// Cache view. Sizes only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    /// Distinct keys written.
    pub size: usize,
}

/// Builds [`KernelSnapshot`]s.
pub struct KernelSnapshotter {
    bus: Rc<EventBus>,
    loader: Rc<ModuleLoader>,
    schemas: Rc<SchemaRegistry>,
    watchdog: Option<Rc<WatchdogCore>>,
    cache: Option<Rc<CacheStore>>,
    clock: Rc<dyn Clock>,
    started_at: u64,
}

impl KernelSnapshotter {
    /// Create a snapshotter; uptime is measured from now.
    pub fn new(bus: Rc<EventBus>, loader: Rc<ModuleLoader>, schemas: Rc<SchemaRegistry>) -> Self {
        let clock = bus.clock();
        let started_at = clock.now_ms();
        Self {
            bus,
            loader,
            schemas,
            watchdog: None,
            cache: None,
            clock,
            started_at,
        }
    }

    /// Include watchdog state.
    #[must_use]
    pub fn with_watchdog(mut self, watchdog: Rc<WatchdogCore>) -> Self {
        self.watchdog = Some(watchdog);
        self
    }

    /// Include cache size.
    #[must_use]
    pub fn with_cache(mut self, cache: Rc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Take a snapshot.
    pub fn snapshot(&self) -> KernelSnapshot {
        let now = self.clock.now_ms();
        let history = self.bus.history();
        let transitions = last_transitions(&history);

        let modules = self
            .loader
            .snapshot()
            .into_iter()
            .map(|info| ModuleSnapshot {
                last_lifecycle_transition: transitions.get(info.id.as_str()).cloned(),
                state: info.state.as_str().to_owned(),
                manifest: info.manifest,
                id: info.id,
            })
            .collect();

        let skip = history.len().saturating_sub(HISTORY_TAIL);
        let counts = BusCounts {
            total_history: history.len(),
            listener_count: self.bus.listener_count(),
            queued: self.bus.queue_len(),
            schemas_registered: self.bus.schema_count(),
        };

        KernelSnapshot {
            meta: SnapshotMeta {
                timestamp: now,
                version: SNAPSHOT_VERSION.to_owned(),
                uptime_ms: now.saturating_sub(self.started_at),
            },
            modules,
            event_bus: BusSnapshot {
                history_tail: history.get(skip..).map(<[EventRecord]>::to_vec).unwrap_or_default(),
                counts,
            },
            schemas: self.schemas.snapshot(),
            watchdog: self.watchdog.as_ref().map(|w| w.snapshot()),
            cache: self.cache.as_ref().map(|c| CacheSnapshot { size: c.size() }),
        }
    }
}

impl std::fmt::Debug for KernelSnapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSnapshotter")
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

fn last_transitions(history: &[EventRecord]) -> HashMap<&str, LifecycleTransition> {
    let mut transitions = HashMap::new();
    for record in history.iter().filter(|r| r.name == LIFECYCLE_EVENT) {
        let Some(module_id) = record.payload.get("moduleId").and_then(Value::as_str) else {
            continue;
        };
        let text = |key: &str| {
            record
                .payload
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned()
        };
        transitions.insert(
            module_id,
            LifecycleTransition {
                timestamp: record
                    .payload
                    .get("timestamp")
                    .and_then(Value::as_u64)
                    .unwrap_or(record.timestamp),
                prev_state: text("prevState"),
                next_state: text("nextState"),
                reason: text("reason"),
            },
        );
    }
    transitions
}
