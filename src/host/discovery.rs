//! Module discovery: find `<base_dir>/<entry>/manifest.json` files.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::HostFs;

/// One manifest found on disk, parsed or not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredModule {
    /// Path of the manifest file.
    pub manifest_path: String,
    /// Parsed JSON document, when it parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_json: Option<Value>,
    /// Read or parse failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Scan `base_dir` for module manifests, sorted by path. A missing base
/// directory yields an empty list; unreadable or malformed manifests are
/// reported per entry.
///
/// # Errors
///
/// Returns an error only when the base directory exists but cannot be
/// listed.
pub async fn discover_modules(fs: &dyn HostFs, base_dir: &str) -> anyhow::Result<Vec<DiscoveredModule>> {
    let base_dir = base_dir.trim_end_matches('/');
    if !fs.exists(base_dir).await? {
        debug!(base_dir, "module directory does not exist");
        return Ok(Vec::new());
    }

    let mut results = Vec::new();
    for entry in fs.list_dir(base_dir).await? {
        let manifest_path = format!("{base_dir}/{entry}/manifest.json");
        if !fs.exists(&manifest_path).await.unwrap_or(false) {
            continue;
        }
        let discovered = match fs.read_text_file(&manifest_path).await {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(json) => DiscoveredModule {
                    manifest_path,
                    manifest_json: Some(json),
                    error: None,
                },
                Err(e) => DiscoveredModule {
                    manifest_path,
                    manifest_json: None,
                    error: Some(format!("JSON parse error: {e}")),
                },
            },
            Err(e) => DiscoveredModule {
                manifest_path,
                manifest_json: None,
                error: Some(format!("read error: {e}")),
            },
        };
        results.push(discovered);
    }

    results.sort_by(|a, b| a.manifest_path.cmp(&b.manifest_path));
    debug!(base_dir, found = results.len(), "module discovery complete");
    Ok(results)
}
