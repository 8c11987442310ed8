//! Passive observer that turns diagnostics into enforcement.
//!
//! The watchdog listens as the kernel for rate, storm and invariant
//! diagnostics, keeps per-source statistics and applies the configured
//! policy. The kernel itself is never contained: offences attributed to it
//! are downgraded to a `kernel_protected` warning.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{WatchdogConfig, WatchdogPolicy};
use crate::kernel::error::KernelError;
use crate::kernel::event_bus::{EventBus, Subscription};
use crate::kernel::loader::ModuleLoader;
use crate::kernel::KERNEL_SOURCE;

/// Counters kept for each offending source. Never decrease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStats {
    /// `diagnostic:signal_rate` observations.
    pub signal_rate_violations: u64,
    /// Schema violations and dispose errors.
    pub invariant_violations: u64,
    /// Signal-rate and storm observations.
    pub consecutive_bursts: u64,
}

/// Stats for one source, as exposed in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatsEntry {
    /// Source id.
    pub module_id: String,
    /// Counters.
    #[serde(flatten)]
    pub stats: ModuleStats,
}

/// Effective policy table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySummary {
    /// Policy for modules without an override.
    pub default_policy: WatchdogPolicy,
    /// Per-module overrides.
    pub module_overrides: BTreeMap<String, WatchdogPolicy>,
}

/// Observable watchdog state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchdogSnapshot {
    /// Policy table.
    pub policy: PolicySummary,
    /// Stats per source, sorted by id.
    pub stats: Vec<ModuleStatsEntry>,
}

#[derive(Debug, Clone, Copy)]
enum Observation {
    SignalRate,
    EventStorm,
    SchemaViolation,
    DisposeError,
}

impl Observation {
    const ALL: [Observation; 4] = [
        Self::SignalRate,
        Self::EventStorm,
        Self::SchemaViolation,
        Self::DisposeError,
    ];

    fn event(self) -> &'static str {
        match self {
            Self::SignalRate => "diagnostic:signal_rate",
            Self::EventStorm => "diagnostic:event_storm",
            Self::SchemaViolation => "diagnostic:schema_violation",
            Self::DisposeError => "diagnostic:dispose_error",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::SignalRate => "signal_rate",
            Self::EventStorm => "event_storm",
            Self::SchemaViolation => "schema_violation",
            Self::DisposeError => "dispose_error",
        }
    }

    /// Source the diagnostic blames.
    fn offender(self, payload: &Value) -> Option<String> {
        let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_owned);
        match self {
            Self::SignalRate => field("source"),
            Self::EventStorm => Some(field("source").unwrap_or_else(|| KERNEL_SOURCE.to_owned())),
            Self::SchemaViolation => Some(field("source").unwrap_or_else(|| "unknown".to_owned())),
            Self::DisposeError => Some(field("moduleId").unwrap_or_else(|| "unknown".to_owned())),
        }
    }
}

/// Diagnostic-driven policy engine.
pub struct WatchdogCore {
    me: Weak<WatchdogCore>,
    bus: Rc<EventBus>,
    loader: Rc<ModuleLoader>,
    config: WatchdogConfig,
    stats: RefCell<BTreeMap<String, ModuleStats>>,
    subscriptions: RefCell<Vec<Subscription>>,
}

impl WatchdogCore {
    /// Create an idle watchdog. Call [`WatchdogCore::start`] to subscribe.
    pub fn new(bus: Rc<EventBus>, loader: Rc<ModuleLoader>, config: WatchdogConfig) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            loader,
            config,
            stats: RefCell::new(BTreeMap::new()),
            subscriptions: RefCell::new(Vec::new()),
        })
    }

    /// Subscribe to the observed diagnostics. Calling it again while
    /// subscribed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::EventContract`] if a listener cap is hit.
    pub fn start(&self) -> Result<(), KernelError> {
        if !self.subscriptions.borrow().is_empty() {
            return Ok(());
        }
        let mut subscriptions = Vec::with_capacity(Observation::ALL.len());
        for observation in Observation::ALL {
            let weak = self.me.clone();
            let subscription = self.bus.listen(observation.event(), KERNEL_SOURCE, move |payload| {
                if let Some(watchdog) = weak.upgrade() {
                    watchdog.observe(observation, payload);
                }
                Ok(())
            });
            match subscription {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => {
                    for subscription in &subscriptions {
                        subscription.unsubscribe();
                    }
                    return Err(err);
                }
            }
        }
        *self.subscriptions.borrow_mut() = subscriptions;
        debug!("watchdog started");
        Ok(())
    }

    /// Unsubscribe from every observed diagnostic.
    pub fn stop(&self) {
        let subscriptions = std::mem::take(&mut *self.subscriptions.borrow_mut());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        debug!("watchdog stopped");
    }

    /// Whether the watchdog is subscribed.
    pub fn is_running(&self) -> bool {
        !self.subscriptions.borrow().is_empty()
    }

    /// Stats for `module_id`, if it ever offended.
    pub fn stats_for(&self, module_id: &str) -> Option<ModuleStats> {
        self.stats.borrow().get(module_id).copied()
    }

    /// Policy table and stats.
    pub fn snapshot(&self) -> WatchdogSnapshot {
        WatchdogSnapshot {
            policy: PolicySummary {
                default_policy: self.config.default_policy,
                module_overrides: self.config.module_policies.clone(),
            },
            stats: self
                .stats
                .borrow()
                .iter()
                .map(|(id, stats)| ModuleStatsEntry {
                    module_id: id.clone(),
                    stats: *stats,
                })
                .collect(),
        }
    }

    fn observe(&self, observation: Observation, payload: &Value) {
        let Some(offender) = observation.offender(payload) else {
            return;
        };
        {
            let mut stats = self.stats.borrow_mut();
            let entry = stats.entry(offender.clone()).or_default();
            match observation {
                Observation::SignalRate => {
                    entry.signal_rate_violations = entry.signal_rate_violations.saturating_add(1);
                    entry.consecutive_bursts = entry.consecutive_bursts.saturating_add(1);
                }
                Observation::EventStorm => {
                    entry.consecutive_bursts = entry.consecutive_bursts.saturating_add(1);
                }
                Observation::SchemaViolation | Observation::DisposeError => {
                    entry.invariant_violations = entry.invariant_violations.saturating_add(1);
                }
            }
        }
        self.apply_policy(&offender, observation.reason(), payload);
    }

    fn apply_policy(&self, module_id: &str, reason: &str, payload: &Value) {
        let policy = self.config.policy_for(module_id);
        warn!(module = module_id, policy = policy.as_str(), reason, "watchdog policy evaluation");

        if module_id == KERNEL_SOURCE {
            self.bus.publish_kernel(
                "diagnostic:watchdog_warning",
                json!({
                    "moduleId": module_id,
                    "reason": "kernel_protected",
                    "payload": { "reason": reason, "payload": payload },
                }),
            );
            return;
        }

        let enforcement_reason = format!("watchdog:{reason}");
        let (outcome, event) = match policy {
            WatchdogPolicy::Warn => {
                self.bus.publish_kernel(
                    "diagnostic:watchdog_warning",
                    json!({ "moduleId": module_id, "reason": reason, "payload": payload }),
                );
                return;
            }
            WatchdogPolicy::Contain => (
                self.loader.stop(module_id, &enforcement_reason, None),
                "diagnostic:watchdog_contain",
            ),
            WatchdogPolicy::Isolate => (
                self.loader.isolate(module_id, &enforcement_reason, None),
                "diagnostic:watchdog_isolate",
            ),
        };

        match outcome {
            Ok(_) => self.bus.publish_kernel(
                event,
                json!({ "moduleId": module_id, "reason": reason }),
            ),
            Err(err) => {
                warn!(module = module_id, reason, error = %err, "watchdog enforcement failed");
                self.bus.publish_kernel(
                    "diagnostic:watchdog_error",
                    json!({ "moduleId": module_id, "reason": reason, "error": err.to_string() }),
                );
            }
        }
    }
}

impl std::fmt::Debug for WatchdogCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogCore")
            .field("running", &self.is_running())
            .field("tracked", &self.stats.borrow().len())
            .finish()
    }
}
