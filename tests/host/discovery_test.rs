//! Manifest discovery over the in-memory and local filesystem hosts.

use serde_json::json;
use warden::host::{discover_modules, LocalFs, MemoryFs};

#[tokio::test]
async fn memory_fs_discovery_is_sorted_and_per_entry() {
    let fs = MemoryFs::default();
    fs.insert_file("/mods/zeta/manifest.json", r#"{"id":"zeta","version":"1.0.0"}"#);
    fs.insert_file("/mods/alpha/manifest.json", r#"{"id":"alpha","version":"0.1.0"}"#);
    fs.insert_file("/mods/broken/manifest.json", "{");
    fs.insert_file("/mods/notes/readme.md", "# notes");

    let found = discover_modules(&fs, "/mods/").await.expect("discover");
    let paths: Vec<&str> = found.iter().map(|m| m.manifest_path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/mods/alpha/manifest.json",
            "/mods/broken/manifest.json",
            "/mods/zeta/manifest.json",
        ]
    );
    assert_eq!(
        found[0].manifest_json,
        Some(json!({ "id": "alpha", "version": "0.1.0" }))
    );
    assert!(found[1].manifest_json.is_none());
    assert!(found[1]
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("JSON parse error")));
}

#[tokio::test]
async fn missing_base_directory_yields_nothing() {
    let fs = MemoryFs::default();
    assert!(discover_modules(&fs, "/absent").await.expect("discover").is_empty());
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("absent");
    let found = discover_modules(&LocalFs, &missing.to_string_lossy())
        .await
        .expect("discover");
    assert!(found.is_empty());
}

#[tokio::test]
async fn local_fs_discovery_reads_manifests_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let module_dir = dir.path().join("ticker");
    std::fs::create_dir_all(&module_dir).expect("mkdir");
    std::fs::write(
        module_dir.join("manifest.json"),
        r#"{"id":"ticker","version":"1.2.3","permissions":[]}"#,
    )
    .expect("write manifest");
    std::fs::create_dir_all(dir.path().join("empty")).expect("mkdir");
    std::fs::write(dir.path().join("stray.txt"), "not a module").expect("write stray");

    let base = dir.path().to_string_lossy().into_owned();
    let found = discover_modules(&LocalFs, &base).await.expect("discover");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].manifest_path, format!("{base}/ticker/manifest.json"));
    assert_eq!(found[0].manifest_json.as_ref().map(|m| m["id"].clone()), Some(json!("ticker")));
    assert!(found[0].error.is_none());
}
