//! Module manifests: identity, version, requested permissions and declared
//! payload schemas.
//!
//! Validation is all-or-nothing and happens before any registration side
//! effect. Every failure is also published as `diagnostic:manifest_invalid`
//! so operators see rejected modules without inspecting return values.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::kernel::clock::Clock;
use crate::kernel::event_bus::EventBus;
use crate::kernel::is_valid_name;
use crate::kernel::permission::Permission;

/// A payload schema declared by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSchema {
    /// Event name the schema applies to.
    pub key: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Static description of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    /// Module id; must equal the module's name.
    #[serde(default)]
    pub id: String,
    /// Semantic version, e.g. `1.2.0-beta.1`.
    #[serde(default)]
    pub version: String,
    /// Requested permission tokens.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared payload schemas.
    #[serde(default)]
    pub schemas: Vec<ManifestSchema>,
}

/// Compact manifest view used in snapshots and scan results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    /// Module id.
    pub id: String,
    /// Version string.
    pub version: String,
    /// Number of requested permissions.
    pub permissions_count: usize,
    /// Number of declared schemas.
    pub schemas_count: usize,
}

/// Why a manifest was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// The `id` field is empty.
    #[error("manifest id is required")]
    MissingId,

    /// The id violates the naming pattern.
    #[error("manifest id \"{0}\" is invalid")]
    InvalidId(String),

    /// The `version` field is empty.
    #[error("manifest version is required")]
    MissingVersion,

    /// The version is not semantic-version shaped.
    #[error("manifest version \"{0}\" is invalid")]
    InvalidVersion(String),

    /// A permission token outside the closed set.
    #[error("manifest permission \"{0}\" is invalid")]
    InvalidPermission(String),

    /// A schema key that is empty or violates the naming pattern.
    #[error("manifest schema key \"{0}\" is invalid")]
    InvalidSchemaKey(String),

    /// The manifest describes a different module than the one supplied.
    #[error("manifest id \"{manifest_id}\" does not match module name \"{module_name}\"")]
    IdMismatch {
        /// Id in the manifest.
        manifest_id: String,
        /// Name reported by the module.
        module_name: String,
    },

    /// The manifest document does not have the expected shape.
    #[error("manifest is malformed: {0}")]
    Malformed(String),
}

impl ManifestError {
    /// Manifest field the failure concerns.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingId | Self::InvalidId(_) | Self::IdMismatch { .. } => "id",
            Self::MissingVersion | Self::InvalidVersion(_) => "version",
            Self::InvalidPermission(_) => "permissions",
            Self::InvalidSchemaKey(_) => "schemas",
            Self::Malformed(_) => "manifest",
        }
    }

    /// Short reason string carried by the diagnostic record.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingId => "missing id",
            Self::InvalidId(_) => "invalid id format",
            Self::MissingVersion => "missing version",
            Self::InvalidVersion(_) => "invalid version format",
            Self::InvalidPermission(_) => "invalid permission",
            Self::InvalidSchemaKey(_) => "invalid schema key",
            Self::IdMismatch { .. } => "id does not match module name",
            Self::Malformed(_) => "malformed manifest",
        }
    }
}

impl ModuleManifest {
    /// Minimal manifest with no permissions or schemas.
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            permissions: Vec::new(),
            display_name: None,
            description: None,
            schemas: Vec::new(),
        }
    }

    /// Add requested permissions.
    #[must_use]
    pub fn with_permissions(mut self, permissions: &[Permission]) -> Self {
        self.permissions
            .extend(permissions.iter().map(|p| p.as_str().to_owned()));
        self
    }

    /// Add a declared schema key.
    #[must_use]
    pub fn with_schema(mut self, key: impl Into<String>, description: Option<&str>) -> Self {
        self.schemas.push(ManifestSchema {
            key: key.into(),
            description: description.map(str::to_owned),
        });
        self
    }

    /// Parse a manifest document.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::Malformed`] when fields have the wrong type.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        serde_json::from_value(value).map_err(|e| ManifestError::Malformed(e.to_string()))
    }

    /// Check every field and return the parsed permission set.
    ///
    /// # Errors
    ///
    /// Returns the first [`ManifestError`] found, checking id, version,
    /// permissions and schema keys in that order.
    pub fn validate(&self) -> Result<Vec<Permission>, ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::MissingId);
        }
        if !is_valid_name(&self.id) {
            return Err(ManifestError::InvalidId(self.id.clone()));
        }
        if self.version.is_empty() {
            return Err(ManifestError::MissingVersion);
        }
        if semver::Version::parse(&self.version).is_err() {
            return Err(ManifestError::InvalidVersion(self.version.clone()));
        }
        let mut permissions = Vec::with_capacity(self.permissions.len());
        for token in &self.permissions {
            let permission = token
                .parse::<Permission>()
                .map_err(|_| ManifestError::InvalidPermission(token.clone()))?;
            permissions.push(permission);
        }
        for schema in &self.schemas {
            if !is_valid_name(&schema.key) {
                return Err(ManifestError::InvalidSchemaKey(schema.key.clone()));
            }
        }
        Ok(permissions)
    }

    /// Compact view for snapshots.
    pub fn summary(&self) -> ManifestSummary {
        ManifestSummary {
            id: self.id.clone(),
            version: self.version.clone(),
            permissions_count: self.permissions.len(),
            schemas_count: self.schemas.len(),
        }
    }
}

/// Validate `manifest`, publishing `diagnostic:manifest_invalid` on failure.
///
/// # Errors
///
/// Returns the [`ManifestError`] produced by [`ModuleManifest::validate`].
pub fn validate_manifest(
    manifest: &ModuleManifest,
    bus: &EventBus,
) -> Result<Vec<Permission>, ManifestError> {
    manifest.validate().map_err(|err| {
        report_invalid(bus, &manifest.id, &err);
        err
    })
}

/// Publish `diagnostic:manifest_invalid` for `err`.
pub fn report_invalid(bus: &EventBus, module_id: &str, err: &ManifestError) {
    let module_id = if module_id.is_empty() {
        "unknown"
    } else {
        module_id
    };
    warn!(module = module_id, field = err.field(), error = %err, "manifest rejected");
    bus.publish_kernel(
        "diagnostic:manifest_invalid",
        json!({
            "moduleId": module_id,
            "reason": err.reason(),
            "field": err.field(),
            "timestamp": bus.clock().now_ms(),
        }),
    );
}
