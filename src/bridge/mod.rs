//! Command dispatch surface for callers outside the module graph.
//!
//! Every command arrives as a name, a JSON payload and a [`CommandMeta`]
//! naming the caller. The payload shape is checked before any kernel
//! component is touched; permission checks happen inside the components.

pub mod transport;

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::host::{discover_modules, HostAdapter};
use crate::kernel::cache::CacheStore;
use crate::kernel::error::KernelError;
use crate::kernel::event_bus::EventBus;
use crate::kernel::loader::{KernelModule, ModuleLoader, ModuleState, RegistrationRequest};
use crate::kernel::manifest::{report_invalid, validate_manifest, ModuleManifest};
use crate::kernel::schema::{builtin_validator, SchemaRegistry};
use crate::kernel::snapshot::KernelSnapshotter;
use crate::kernel::KERNEL_SOURCE;

pub use transport::{
    HostRouting, KernelRequestEnvelope, KernelResponseEnvelope, KernelTransport, LocalTransport,
    TransportError, TransportResponse, UnifiedTransport,
};

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// The closed set of bridge commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelCommand {
    /// `kernel.snapshot.get`
    SnapshotGet,
    /// `event.emit`
    EventEmit,
    /// `module.register`
    ModuleRegister,
    /// `module.start`
    ModuleStart,
    /// `module.stop`
    ModuleStop,
    /// `module.isolate`
    ModuleIsolate,
    /// `module.reset`
    ModuleReset,
    /// `cache.get`
    CacheGet,
    /// `cache.set`
    CacheSet,
    /// `schema.bindValidator`
    SchemaBindValidator,
    /// `host.modules.scan`
    HostModulesScan,
}

impl KernelCommand {
    /// Every command, in wire-name order of the command table.
    pub const ALL: [KernelCommand; 11] = [
        Self::SnapshotGet,
        Self::EventEmit,
        Self::ModuleRegister,
        Self::ModuleStart,
        Self::ModuleStop,
        Self::ModuleIsolate,
        Self::ModuleReset,
        Self::CacheGet,
        Self::CacheSet,
        Self::SchemaBindValidator,
        Self::HostModulesScan,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SnapshotGet => "kernel.snapshot.get",
            Self::EventEmit => "event.emit",
            Self::ModuleRegister => "module.register",
            Self::ModuleStart => "module.start",
            Self::ModuleStop => "module.stop",
            Self::ModuleIsolate => "module.isolate",
            Self::ModuleReset => "module.reset",
            Self::CacheGet => "cache.get",
            Self::CacheSet => "cache.set",
            Self::SchemaBindValidator => "schema.bindValidator",
            Self::HostModulesScan => "host.modules.scan",
        }
    }
}

impl fmt::Display for KernelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelCommand {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| KernelError::KernelBridge(format!("unknown command \"{s}\"")))
    }
}

/// Who is issuing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMeta {
    /// Caller source id; permission checks run against it.
    #[serde(default)]
    pub source: String,
}

impl CommandMeta {
    /// Meta for `source`.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Meta for the kernel itself.
    pub fn kernel() -> Self {
        Self::new(KERNEL_SOURCE)
    }
}

// ---------------------------------------------------------------------------
// Module catalog
// ---------------------------------------------------------------------------

/// Builds a fresh module instance.
pub type ModuleFactory = Rc<dyn Fn() -> Rc<dyn KernelModule>>;

/// Named module factories the host makes available to `module.register`.
#[derive(Default)]
pub struct ModuleCatalog {
    factories: std::cell::RefCell<BTreeMap<String, ModuleFactory>>,
}

impl ModuleCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the factory for `name`.
    pub fn insert(&self, name: &str, factory: impl Fn() -> Rc<dyn KernelModule> + 'static) {
        self.factories
            .borrow_mut()
            .insert(name.to_owned(), Rc::new(factory));
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.borrow().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.factories.borrow().keys().cloned().collect()
    }

    /// Build a module by name.
    pub fn instantiate(&self, name: &str) -> Option<Rc<dyn KernelModule>> {
        let factory = self.factories.borrow().get(name).cloned();
        factory.map(|make| make())
    }
}

impl fmt::Debug for ModuleCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCatalog")
            .field("names", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scan report
// ---------------------------------------------------------------------------

/// Outcome for one manifest found by `host.modules.scan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    /// Path of the manifest file.
    pub manifest_path: String,
    /// Whether the manifest read, parsed and validated.
    pub ok: bool,
    /// Why it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of a valid manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Dispatches [`KernelCommand`]s onto kernel components.
pub struct KernelBridge {
    bus: Rc<EventBus>,
    loader: Rc<ModuleLoader>,
    cache: Rc<CacheStore>,
    schemas: Rc<SchemaRegistry>,
    snapshotter: Rc<KernelSnapshotter>,
    catalog: Rc<ModuleCatalog>,
    host: Option<HostAdapter>,
}

impl KernelBridge {
    /// Wire a bridge over existing components.
    pub fn new(
        bus: Rc<EventBus>,
        loader: Rc<ModuleLoader>,
        cache: Rc<CacheStore>,
        schemas: Rc<SchemaRegistry>,
        snapshotter: Rc<KernelSnapshotter>,
        catalog: Rc<ModuleCatalog>,
        host: Option<HostAdapter>,
    ) -> Self {
        Self {
            bus,
            loader,
            cache,
            schemas,
            snapshotter,
            catalog,
            host,
        }
    }

    /// Whether `host.modules.scan` has a filesystem to read.
    pub fn can_scan(&self) -> bool {
        self.host.as_ref().is_some_and(|h| h.fs.is_some())
    }

    /// Execute `name` with `payload` on behalf of `meta.source`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::KernelBridge`] for a missing source, an
    /// unknown command or a malformed payload; any error the target
    /// component raises is passed through unchanged.
    pub async fn dispatch(
        &self,
        name: &str,
        payload: Value,
        meta: &CommandMeta,
    ) -> Result<Value, KernelError> {
        if meta.source.is_empty() {
            return Err(bridge_error("command meta requires a non-empty source"));
        }
        let command: KernelCommand = name.parse()?;
        debug!(command = %command, source = %meta.source, "bridge dispatch");
        let source = meta.source.as_str();

        match command {
            KernelCommand::SnapshotGet => {
                if !is_empty_payload(&payload) {
                    return Err(bridge_error("kernel.snapshot.get does not accept a payload"));
                }
                serde_json::to_value(self.snapshotter.snapshot())
                    .map_err(|e| bridge_error(&format!("snapshot is not serializable: {e}")))
            }
            KernelCommand::EventEmit => {
                let map = require_object(&payload, command)?;
                let name = require_text(map, "name", command)?;
                let event_payload = require_field(map, "payload", command)?.clone();
                self.bus.emit(name, event_payload, source)?;
                Ok(json!({ "ok": true }))
            }
            KernelCommand::ModuleRegister => {
                require_kernel(source, command)?;
                let request = self.parse_registration(&payload)?;
                let id = match &request {
                    RegistrationRequest::Legacy(module) => module.name().to_owned(),
                    RegistrationRequest::Declared { manifest, .. } => manifest.id.clone(),
                };
                self.loader.register(request)?;
                info!(module = %id, "module registered over bridge");
                Ok(json!({ "ok": true, "id": id }))
            }
            KernelCommand::ModuleStart => {
                let id = require_id(&payload, command)?;
                let state = self.loader.start_with(id, Some(source))?;
                Ok(state_result(state))
            }
            KernelCommand::ModuleStop => {
                let (id, reason) = require_id_and_reason(&payload, command, "stop")?;
                let state = self.loader.stop(id, reason, Some(source))?;
                Ok(state_result(state))
            }
            KernelCommand::ModuleIsolate => {
                let (id, reason) = require_id_and_reason(&payload, command, "isolate")?;
                let state = self.loader.isolate(id, reason, Some(source))?;
                Ok(state_result(state))
            }
            KernelCommand::ModuleReset => {
                let (id, reason) = require_id_and_reason(&payload, command, "reset")?;
                let state = self.loader.reset(id, reason, Some(source))?;
                Ok(state_result(state))
            }
            KernelCommand::CacheGet => {
                let map = require_object(&payload, command)?;
                let key = require_text(map, "key", command)?;
                let value = self.cache.get(key, source).await?;
                Ok(json!({ "value": value.unwrap_or(Value::Null) }))
            }
            KernelCommand::CacheSet => {
                let map = require_object(&payload, command)?;
                let key = require_text(map, "key", command)?;
                let value = require_field(map, "value", command)?;
                self.cache.set(key, value, source).await?;
                Ok(json!({ "ok": true }))
            }
            KernelCommand::SchemaBindValidator => {
                let map = require_object(&payload, command)?;
                let key = require_text(map, "key", command)?;
                let validator_id = require_text(map, "validatorId", command)?;
                let validator = builtin_validator(validator_id).ok_or_else(|| {
                    bridge_error(&format!("unknown validatorId \"{validator_id}\""))
                })?;
                self.schemas.bind_validator(key, validator, source)?;
                Ok(json!({ "ok": true }))
            }
            KernelCommand::HostModulesScan => {
                require_kernel(source, command)?;
                let fs = self
                    .host
                    .as_ref()
                    .and_then(|h| h.fs.clone())
                    .ok_or_else(|| bridge_error("host.modules.scan requires a host adapter"))?;
                let map = require_object(&payload, command)?;
                let base_dir = require_text(map, "baseDir", command)?;
                let discovered = discover_modules(fs.as_ref(), base_dir)
                    .await
                    .map_err(|e| bridge_error(&format!("module scan failed: {e:#}")))?;
                let entries: Vec<ScanEntry> = discovered
                    .into_iter()
                    .map(|found| self.check_discovered(found))
                    .collect();
                info!(base_dir, found = entries.len(), "module scan complete");
                serde_json::to_value(entries)
                    .map_err(|e| bridge_error(&format!("scan report is not serializable: {e}")))
            }
        }
    }

    fn check_discovered(&self, found: crate::host::DiscoveredModule) -> ScanEntry {
        let manifest_path = found.manifest_path;
        let Some(json) = found.manifest_json else {
            return ScanEntry {
                manifest_path,
                ok: false,
                error: Some(found.error.unwrap_or_else(|| "unreadable manifest".to_owned())),
                manifest_id: None,
            };
        };
        let checked = self.parse_manifest(json).and_then(|manifest| {
            validate_manifest(&manifest, &self.bus)
                .map(|_| manifest.id)
                .map_err(KernelError::from)
        });
        match checked {
            Ok(id) => ScanEntry {
                manifest_path,
                ok: true,
                error: None,
                manifest_id: Some(id),
            },
            Err(err) => ScanEntry {
                manifest_path,
                ok: false,
                error: Some(err.to_string()),
                manifest_id: None,
            },
        }
    }

    /// Parse a manifest document, reporting malformed ones like invalid ones.
    fn parse_manifest(&self, value: Value) -> Result<ModuleManifest, KernelError> {
        let claimed_id = value
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        ModuleManifest::from_value(value).map_err(|err| {
            report_invalid(&self.bus, &claimed_id, &err);
            KernelError::from(err)
        })
    }

    fn parse_registration(&self, payload: &Value) -> Result<RegistrationRequest, KernelError> {
        let command = KernelCommand::ModuleRegister;
        let map = require_object(payload, command)?;
        let (manifest, module) = match map.get("definition") {
            Some(definition) => {
                let definition = definition.as_object().ok_or_else(|| {
                    bridge_error("module.register definition must be an object")
                })?;
                (definition.get("manifest"), definition.get("module"))
            }
            None => (map.get("manifest"), map.get("module")),
        };

        let module_name = match module {
            Some(Value::String(name)) if !name.is_empty() => name.as_str(),
            Some(_) => {
                return Err(bridge_error(
                    "module.register module must name a catalog entry",
                ))
            }
            None => return Err(bridge_error("module.register missing \"module\"")),
        };
        let module = self.catalog.instantiate(module_name).ok_or_else(|| {
            bridge_error(&format!("module \"{module_name}\" is not in the catalog"))
        })?;

        match manifest {
            None | Some(Value::Null) => Ok(RegistrationRequest::Legacy(module)),
            Some(value) => {
                let manifest = self.parse_manifest(value.clone())?;
                Ok(RegistrationRequest::Declared { manifest, module })
            }
        }
    }
}

impl fmt::Debug for KernelBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBridge")
            .field("catalog", &self.catalog)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Payload checks
// ---------------------------------------------------------------------------

fn bridge_error(message: &str) -> KernelError {
    KernelError::KernelBridge(message.to_owned())
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn require_kernel(source: &str, command: KernelCommand) -> Result<(), KernelError> {
    if source == KERNEL_SOURCE {
        Ok(())
    } else {
        Err(bridge_error(&format!("{command} is restricted to the kernel")))
    }
}

fn require_object(payload: &Value, command: KernelCommand) -> Result<&Map<String, Value>, KernelError> {
    payload
        .as_object()
        .ok_or_else(|| bridge_error(&format!("{command} requires an object payload")))
}

fn require_field<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    command: KernelCommand,
) -> Result<&'a Value, KernelError> {
    map.get(key)
        .ok_or_else(|| bridge_error(&format!("{command} missing \"{key}\"")))
}

fn require_text<'a>(
    map: &'a Map<String, Value>,
    key: &str,
    command: KernelCommand,
) -> Result<&'a str, KernelError> {
    match require_field(map, key, command)? {
        Value::String(text) if !text.is_empty() => Ok(text.as_str()),
        _ => Err(bridge_error(&format!(
            "{command} requires a non-empty {key}"
        ))),
    }
}

fn require_id(payload: &Value, command: KernelCommand) -> Result<&str, KernelError> {
    let map = require_object(payload, command)?;
    require_text(map, "id", command)
}

fn require_id_and_reason<'a>(
    payload: &'a Value,
    command: KernelCommand,
    default_reason: &'static str,
) -> Result<(&'a str, &'a str), KernelError> {
    let map = require_object(payload, command)?;
    let id = require_text(map, "id", command)?;
    let reason = match map.get("reason") {
        None | Some(Value::Null) => default_reason,
        Some(Value::String(reason)) if !reason.is_empty() => reason.as_str(),
        Some(_) => {
            return Err(bridge_error(&format!(
                "{command} reason must be a non-empty string"
            )))
        }
    };
    Ok((id, reason))
}

fn state_result(state: ModuleState) -> Value {
    json!({ "ok": true, "state": state.as_str() })
}
