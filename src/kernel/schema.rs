//! Schema contracts: modules declare payload keys in their manifests and the
//! bus enforces validators bound to declared keys.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::kernel::error::KernelError;
use crate::kernel::event_bus::EventBus;
use crate::kernel::manifest::ManifestSchema;
use crate::kernel::permission::{Permission, PermissionContext, PermissionSystem};
use crate::kernel::KERNEL_SOURCE;

/// Payload predicate. `Err` carries the human-readable rejection reason.
pub type SchemaValidator = Rc<dyn Fn(&Value) -> Result<(), String>>;

/// A declared schema key and the module that declared it first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDeclaration {
    /// Event name or `prefix:*` pattern.
    pub key: String,
    /// Declaring module id.
    pub owner: String,
    /// Free-form description from the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Observable schema state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    /// Declarations in declaration order.
    pub declarations: Vec<SchemaDeclaration>,
    /// Number of distinct keys with a bound validator.
    pub bound_validators: usize,
}

/// Declaration table plus the binding gate in front of the bus.
pub struct SchemaRegistry {
    bus: Rc<EventBus>,
    permissions: Rc<PermissionSystem>,
    declarations: RefCell<IndexMap<String, SchemaDeclaration>>,
    bound: RefCell<BTreeSet<String>>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new(bus: Rc<EventBus>, permissions: Rc<PermissionSystem>) -> Self {
        Self {
            bus,
            permissions,
            declarations: RefCell::new(IndexMap::new()),
            bound: RefCell::new(BTreeSet::new()),
        }
    }

    /// Record declarations made by `owner`. The first declarer of a key wins;
    /// entries with an empty key are skipped.
    pub fn register_declarations(&self, owner: &str, schemas: &[ManifestSchema]) {
        let mut declarations = self.declarations.borrow_mut();
        for schema in schemas {
            if schema.key.is_empty() {
                continue;
            }
            if declarations.contains_key(&schema.key) {
                debug!(key = %schema.key, owner, "schema key already declared");
                continue;
            }
            declarations.insert(
                schema.key.clone(),
                SchemaDeclaration {
                    key: schema.key.clone(),
                    owner: owner.to_owned(),
                    description: schema.description.clone(),
                },
            );
        }
    }

    /// Whether any module declared `key`.
    pub fn is_declared(&self, key: &str) -> bool {
        self.declarations.borrow().contains_key(key)
    }

    /// Bind `validator` to a declared key and forward it to the bus.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::SchemaContract`] when the key was never
    /// declared, [`KernelError::Permission`] when a non-kernel caller lacks
    /// `schema.register`, and any error the bus raises on registration.
    pub fn bind_validator(
        &self,
        key: &str,
        validator: SchemaValidator,
        source: &str,
    ) -> Result<(), KernelError> {
        if !self.is_declared(key) {
            warn!(key, source, "validator bound to undeclared schema");
            self.bus.publish_kernel(
                "diagnostic:schema_undeclared",
                json!({ "key": key, "source": source }),
            );
            return Err(KernelError::SchemaContract(format!(
                "schema \"{key}\" is not declared by any module"
            )));
        }
        if source != KERNEL_SOURCE {
            self.permissions.assert(
                source,
                Permission::SchemaRegister,
                &PermissionContext::new("schema.register").with_target(key),
            )?;
        }
        self.bus.register_schema(key, source, validator)?;
        self.bound.borrow_mut().insert(key.to_owned());
        Ok(())
    }

    /// Declarations in order plus the bound-validator count.
    pub fn snapshot(&self) -> SchemaSnapshot {
        SchemaSnapshot {
            declarations: self.declarations.borrow().values().cloned().collect(),
            bound_validators: self.bound.borrow().len(),
        }
    }
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("declarations", &self.declarations.borrow().len())
            .field("bound", &self.bound.borrow().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Built-in validators
// ---------------------------------------------------------------------------

/// Ids of validators callers can bind by name over the bridge.
pub const BUILTIN_VALIDATORS: [&str; 3] = ["example:schema", "payload:object", "payload:non_null"];

/// Look up a built-in validator by id.
pub fn builtin_validator(id: &str) -> Option<SchemaValidator> {
    let validator: SchemaValidator = match id {
        "example:schema" => Rc::new(|payload: &Value| match payload.get("ok") {
            Some(Value::Bool(_)) => Ok(()),
            _ => Err("payload.ok must be a boolean".to_owned()),
        }),
        "payload:object" => Rc::new(|payload: &Value| {
            if payload.is_object() {
                Ok(())
            } else {
                Err("payload must be an object".to_owned())
            }
        }),
        "payload:non_null" => Rc::new(|payload: &Value| {
            if payload.is_null() {
                Err("payload must not be null".to_owned())
            } else {
                Ok(())
            }
        }),
        _ => return None,
    };
    Some(validator)
}
