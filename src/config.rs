//! Configuration loading and validation.
//!
//! A single `config.toml` tunes the bus, the watchdog and the host adapter.
//! Every section is optional; an empty file yields the kernel defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level kernel configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KernelConfig {
    /// Event bus options.
    #[serde(default)]
    pub bus: BusConfig,

    /// Watchdog enforcement policy.
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Host adapter options.
    #[serde(default)]
    pub host: HostConfig,
}

/// Event bus options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusConfig {
    /// Validate payloads against bound schema validators.
    #[serde(default)]
    pub enable_schema_validation: bool,

    /// Queueing, drop strategy and batching.
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

/// Which event to discard when the delivery queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum DropStrategy {
    /// Evict the oldest queued event to make room.
    #[default]
    #[serde(rename = "DROP_OLDEST")]
    DropOldest,
    /// Discard the incoming event.
    #[serde(rename = "DROP_NEWEST")]
    DropNewest,
}

impl DropStrategy {
    /// Wire name used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DropOldest => "DROP_OLDEST",
            Self::DropNewest => "DROP_NEWEST",
        }
    }
}

/// Backpressure options. When disabled, delivery is synchronous.
#[derive(Debug, Clone, Deserialize)]
pub struct BackpressureConfig {
    /// Queue emits and deliver them on the next scheduler tick.
    #[serde(default)]
    pub enabled: bool,

    /// Queue capacity before the drop strategy applies.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Overflow behaviour.
    #[serde(default)]
    pub drop_strategy: DropStrategy,

    /// Default batching window in milliseconds.
    #[serde(default = "default_batching_window_ms")]
    pub batching_window_ms: u64,

    /// Maximum payloads collected into one batch.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_queue_size: default_max_queue_size(),
            drop_strategy: DropStrategy::default(),
            batching_window_ms: default_batching_window_ms(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// Enforcement action the watchdog takes against an offending module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchdogPolicy {
    /// Record a warning diagnostic only.
    #[default]
    Warn,
    /// Stop the module.
    Contain,
    /// Isolate the module until an explicit reset.
    Isolate,
}

impl WatchdogPolicy {
    /// Wire name used in diagnostics and snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "WARN",
            Self::Contain => "CONTAIN",
            Self::Isolate => "ISOLATE",
        }
    }
}

/// Watchdog policy table.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchdogConfig {
    /// Policy for modules without an override.
    #[serde(default)]
    pub default_policy: WatchdogPolicy,

    /// Per-module overrides keyed by module id.
    #[serde(default)]
    pub module_policies: BTreeMap<String, WatchdogPolicy>,
}

impl WatchdogConfig {
    /// Effective policy for `module_id`.
    pub fn policy_for(&self, module_id: &str) -> WatchdogPolicy {
        self.module_policies
            .get(module_id)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

/// Host adapter options.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Key capacity of the in-memory store before LRU eviction.
    #[serde(default = "default_store_max_keys")]
    pub store_max_keys: usize,

    /// Directory scanned for module manifests.
    #[serde(default)]
    pub modules_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            store_max_keys: default_store_max_keys(),
            modules_dir: None,
        }
    }
}

// Default value functions for serde

fn default_max_queue_size() -> usize {
    100
}
fn default_batching_window_ms() -> u64 {
    50
}
fn default_max_batch_size() -> usize {
    100
}
fn default_store_max_keys() -> usize {
    1000
}

/// Load the kernel config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<KernelConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    parse_config(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))
}

/// Parse a kernel config from TOML text.
///
/// # Errors
///
/// Returns an error if the text is not valid TOML for [`KernelConfig`].
pub fn parse_config(contents: &str) -> anyhow::Result<KernelConfig> {
    let config: KernelConfig = toml::from_str(contents)?;
    Ok(config)
}

/// Resolve the default config directory (`~/.warden/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".warden"))
}

/// Load `~/.warden/config.toml`, or defaults when it does not exist.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_default_config() -> anyhow::Result<KernelConfig> {
    let path = config_dir()?.join("config.toml");
    if !path.exists() {
        return Ok(KernelConfig::default());
    }
    load_config(&path)
}
