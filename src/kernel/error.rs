//! Closed failure taxonomy shared by every kernel component.
//!
//! Public boundary calls return [`KernelError`]. Failures inside
//! module-supplied code never surface here; they become diagnostic records on
//! the bus instead.

use crate::kernel::manifest::ManifestError;

/// Every failure a kernel boundary call can report.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Bus protocol breach: bad name, missing source, listener cap, kernel
    /// storm or schema violation.
    #[error("event contract violated: {0}")]
    EventContract(String),

    /// The caller lacks the permission the action requires.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Illegal state transition or unknown module.
    #[error("module lifecycle violated: {0}")]
    ModuleLifecycle(String),

    /// Malformed module manifest.
    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    /// Validator binding for a schema key nobody declared.
    #[error("schema contract violated: {0}")]
    SchemaContract(String),

    /// Unknown bridge command or malformed command payload.
    #[error("kernel bridge rejected request: {0}")]
    KernelBridge(String),

    /// Value that cannot be stored in the cache, or a failing backing store.
    #[error("cache rejected operation: {0}")]
    Cache(String),
}

impl KernelError {
    /// Stable machine-readable code used at the transport boundary.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EventContract(_) => "EVENT_CONTRACT_ERROR",
            Self::Permission(_) => "PERMISSION_ERROR",
            Self::ModuleLifecycle(_) => "MODULE_LIFECYCLE_ERROR",
            Self::Manifest(_) => "MANIFEST_ERROR",
            Self::SchemaContract(_) => "SCHEMA_CONTRACT_ERROR",
            Self::KernelBridge(_) => "KERNEL_BRIDGE_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
        }
    }
}
