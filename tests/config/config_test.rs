//! Coverage for config loading from disk.

use std::path::PathBuf;

use warden::config::{load_config, parse_config, DropStrategy, WatchdogPolicy};

#[test]
fn load_full_config_from_file() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[bus]
enable_schema_validation = true

[bus.backpressure]
enabled = true
max_queue_size = 8
drop_strategy = "DROP_NEWEST"
batching_window_ms = 20
max_batch_size = 4

[watchdog]
default_policy = "ISOLATE"

[watchdog.module_policies]
ticker = "WARN"

[host]
store_max_keys = 16
modules_dir = "/srv/warden/modules"
"#,
    )
    .expect("should write config");

    let config = load_config(&path).expect("config should load");
    assert!(config.bus.enable_schema_validation);
    let backpressure = &config.bus.backpressure;
    assert!(backpressure.enabled);
    assert_eq!(backpressure.max_queue_size, 8);
    assert_eq!(backpressure.drop_strategy, DropStrategy::DropNewest);
    assert_eq!(backpressure.batching_window_ms, 20);
    assert_eq!(backpressure.max_batch_size, 4);
    assert_eq!(config.watchdog.policy_for("ticker"), WatchdogPolicy::Warn);
    assert_eq!(config.watchdog.policy_for("other"), WatchdogPolicy::Isolate);
    assert_eq!(config.host.store_max_keys, 16);
    assert_eq!(
        config.host.modules_dir,
        Some(PathBuf::from("/srv/warden/modules"))
    );
}

#[test]
fn missing_file_names_the_path() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("absent.toml");
    let err = load_config(&path).expect_err("missing file should fail");
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn wrong_types_are_rejected() {
    assert!(parse_config("[bus.backpressure]\nmax_queue_size = \"lots\"\n").is_err());
    assert!(parse_config("[bus.backpressure]\ndrop_strategy = \"DROP_RANDOM\"\n").is_err());
}

#[test]
fn partial_sections_keep_defaults() {
    let config = parse_config("[host]\nstore_max_keys = 5\n").expect("should parse");
    assert_eq!(config.host.store_max_keys, 5);
    assert!(!config.bus.backpressure.enabled);
    assert_eq!(config.bus.backpressure.max_queue_size, 100);
    assert!(config.watchdog.module_policies.is_empty());
}
