//! Per-module permission grants and the deduplicated violation reporter.
//!
//! The kernel id is implicitly all-powerful and its grant set is immutable.
//! Every denied assertion raises a [`KernelError::Permission`]; at most one
//! `diagnostic:permission_violation` is published per distinct violation key
//! inside [`VIOLATION_DEDUP_WINDOW_MS`].

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::kernel::clock::Clock;
use crate::kernel::error::KernelError;
use crate::kernel::event_bus::{EventBus, PermissionChecker};
use crate::kernel::{is_valid_name, KERNEL_SOURCE};

/// Window during which a repeated violation is not reported again.
pub const VIOLATION_DEDUP_WINDOW_MS: u64 = 500;

/// Maximum violation keys remembered for deduplication.
pub const VIOLATION_DEDUP_MAX_KEYS: usize = 500;

// ---------------------------------------------------------------------------
// Permission tokens
// ---------------------------------------------------------------------------

/// Closed set of capabilities a module can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Emit `system:*` and `diagnostic:*` events.
    #[serde(rename = "event.emit_reserved")]
    EmitReserved,
    /// Control the lifecycle of other modules.
    #[serde(rename = "kernel.control")]
    KernelControl,
    /// Read from the cache.
    #[serde(rename = "storage.read")]
    StorageRead,
    /// Write to the cache.
    #[serde(rename = "storage.write")]
    StorageWrite,
    /// Read kernel telemetry.
    #[serde(rename = "telemetry.read")]
    TelemetryRead,
    /// Bind schema validators.
    #[serde(rename = "schema.register")]
    SchemaRegister,
    /// Reconfigure backpressure.
    #[serde(rename = "backpressure.configure")]
    BackpressureConfigure,
}

impl Permission {
    /// Every permission token.
    pub const ALL: [Permission; 7] = [
        Self::EmitReserved,
        Self::KernelControl,
        Self::StorageRead,
        Self::StorageWrite,
        Self::TelemetryRead,
        Self::SchemaRegister,
        Self::BackpressureConfigure,
    ];

    /// Wire token, e.g. `storage.read`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmitReserved => "event.emit_reserved",
            Self::KernelControl => "kernel.control",
            Self::StorageRead => "storage.read",
            Self::StorageWrite => "storage.write",
            Self::TelemetryRead => "telemetry.read",
            Self::SchemaRegister => "schema.register",
            Self::BackpressureConfigure => "backpressure.configure",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission \"{s}\""))
    }
}

/// What the caller was trying to do when a permission was asserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionContext {
    /// Action label, e.g. `event.emit` or `module.stop`.
    pub action: String,
    /// Module or key the action targets.
    pub target: Option<String>,
    /// Event being emitted, when relevant.
    pub event_name: Option<String>,
}

impl PermissionContext {
    /// Context for `action` with no target.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    /// Attach the action target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attach the event name.
    #[must_use]
    pub fn with_event(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = Some(event_name.into());
        self
    }

    fn dedup_key(&self, module_id: &str, permission: Permission) -> String {
        format!(
            "{module_id}|{permission}|{}|event:{}|target:{}",
            self.action,
            self.event_name.as_deref().unwrap_or(""),
            self.target.as_deref().unwrap_or(""),
        )
    }
}

// ---------------------------------------------------------------------------
// PermissionSystem
// ---------------------------------------------------------------------------

/// Grant table plus violation reporting.
pub struct PermissionSystem {
    grants: RefCell<HashMap<String, BTreeSet<Permission>>>,
    bus: Weak<EventBus>,
    clock: Rc<dyn Clock>,
    recent_violations: RefCell<IndexMap<String, u64>>,
}

impl PermissionSystem {
    /// Create the permission system and install it as the bus's checker for
    /// reserved namespaces.
    pub fn attach(bus: &Rc<EventBus>) -> Rc<Self> {
        let system = Rc::new(Self {
            grants: RefCell::new(HashMap::new()),
            bus: Rc::downgrade(bus),
            clock: bus.clock(),
            recent_violations: RefCell::new(IndexMap::new()),
        });
        let checker: Weak<dyn PermissionChecker> = Rc::downgrade(&system) as Weak<dyn PermissionChecker>;
        bus.set_permission_checker(checker);
        system
    }

    /// Add `permissions` to the grant set of `module_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] for an invalid id or the kernel id.
    pub fn grant(&self, module_id: &str, permissions: &[Permission]) -> Result<(), KernelError> {
        Self::check_mutable(module_id)?;
        let mut grants = self.grants.borrow_mut();
        let set = grants.entry(module_id.to_owned()).or_default();
        set.extend(permissions.iter().copied());
        debug!(module = module_id, granted = permissions.len(), "permissions granted");
        Ok(())
    }

    /// Remove `permissions` from the grant set of `module_id`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] for an invalid id or the kernel id.
    pub fn revoke(&self, module_id: &str, permissions: &[Permission]) -> Result<(), KernelError> {
        Self::check_mutable(module_id)?;
        let mut grants = self.grants.borrow_mut();
        if let Some(set) = grants.get_mut(module_id) {
            for permission in permissions {
                set.remove(permission);
            }
            if set.is_empty() {
                grants.remove(module_id);
            }
        }
        debug!(module = module_id, revoked = permissions.len(), "permissions revoked");
        Ok(())
    }

    /// Pure lookup. The kernel holds every permission.
    pub fn has(&self, module_id: &str, permission: Permission) -> bool {
        if module_id == KERNEL_SOURCE {
            return true;
        }
        self.grants
            .borrow()
            .get(module_id)
            .is_some_and(|set| set.contains(&permission))
    }

    /// Current grants of `module_id`, sorted.
    pub fn permissions_of(&self, module_id: &str) -> Vec<Permission> {
        if module_id == KERNEL_SOURCE {
            return Permission::ALL.to_vec();
        }
        self.grants
            .borrow()
            .get(module_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Succeed if `module_id` holds `permission`, otherwise report the
    /// violation (deduplicated) and fail.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] on an invalid id or missing grant.
    pub fn assert(
        &self,
        module_id: &str,
        permission: Permission,
        context: &PermissionContext,
    ) -> Result<(), KernelError> {
        if !is_valid_name(module_id) {
            return Err(KernelError::Permission(format!(
                "invalid module id \"{module_id}\""
            )));
        }
        if self.has(module_id, permission) {
            return Ok(());
        }

        warn!(
            module = module_id,
            permission = permission.as_str(),
            action = %context.action,
            "permission denied"
        );
        let key = context.dedup_key(module_id, permission);
        if self.should_report(key) {
            if let Some(bus) = self.bus.upgrade() {
                bus.publish_kernel(
                    "diagnostic:permission_violation",
                    json!({
                        "moduleId": module_id,
                        "permission": permission.as_str(),
                        "action": context.action,
                        "target": context.target,
                        "eventName": context.event_name,
                        "timestamp": self.clock.now_ms(),
                    }),
                );
            }
        }

        let mut message = format!(
            "module \"{module_id}\" lacks {permission} for {}",
            context.action
        );
        if let Some(target) = &context.target {
            message.push_str(&format!(" on \"{target}\""));
        }
        Err(KernelError::Permission(message))
    }

    fn should_report(&self, key: String) -> bool {
        let now = self.clock.now_ms();
        let mut recent = self.recent_violations.borrow_mut();
        if let Some(seen) = recent.get(&key) {
            if now.saturating_sub(*seen) < VIOLATION_DEDUP_WINDOW_MS {
                return false;
            }
        }
        recent.shift_remove(&key);
        recent.insert(key, now);
        while recent.len() > VIOLATION_DEDUP_MAX_KEYS {
            recent.shift_remove_index(0);
        }
        true
    }

    fn check_mutable(module_id: &str) -> Result<(), KernelError> {
        if !is_valid_name(module_id) {
            return Err(KernelError::Permission(format!(
                "invalid module id \"{module_id}\""
            )));
        }
        if module_id == KERNEL_SOURCE {
            return Err(KernelError::Permission(
                "kernel permissions are immutable".to_owned(),
            ));
        }
        Ok(())
    }
}

impl PermissionChecker for PermissionSystem {
    fn assert_permission(
        &self,
        module_id: &str,
        permission: Permission,
        context: &PermissionContext,
    ) -> Result<(), KernelError> {
        self.assert(module_id, permission, context)
    }
}

impl fmt::Debug for PermissionSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionSystem")
            .field("modules", &self.grants.borrow().len())
            .finish()
    }
}
