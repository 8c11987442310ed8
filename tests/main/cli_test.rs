//! CLI contract tests.

use assert_cmd::Command;
use serde_json::Value;

fn warden(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("warden").expect("binary should build");
    cmd.env("HOME", home).env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn selfcheck_prints_snapshot() {
    let home = tempfile::tempdir().expect("should create temp dir");
    let output = warden(home.path())
        .arg("selfcheck")
        .output()
        .expect("selfcheck should run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let snapshot = stdout_json(&output);
    assert_eq!(snapshot["modules"][0]["id"], "ticker");
    assert_eq!(snapshot["modules"][0]["state"], "stopped");
    assert_eq!(
        snapshot["modules"][0]["lastLifecycleTransition"]["reason"],
        "selfcheck"
    );
}

#[test]
fn scan_reports_manifests_in_directory() {
    let home = tempfile::tempdir().expect("should create temp dir");
    let mods = tempfile::tempdir().expect("should create temp dir");
    std::fs::create_dir_all(mods.path().join("notes")).expect("mkdir");
    std::fs::write(
        mods.path().join("notes/manifest.json"),
        r#"{"id":"notes","version":"1.0.0","permissions":["storage.read"]}"#,
    )
    .expect("write manifest");
    std::fs::create_dir_all(mods.path().join("broken")).expect("mkdir");
    std::fs::write(mods.path().join("broken/manifest.json"), r#"{"id":"broken"}"#)
        .expect("write manifest");

    let output = warden(home.path())
        .arg("scan")
        .arg(mods.path())
        .output()
        .expect("scan should run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report = stdout_json(&output);
    let entries = report.as_array().expect("report is an array");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["ok"], false);
    assert!(entries[0]["manifestPath"]
        .as_str()
        .is_some_and(|p| p.ends_with("broken/manifest.json")));
    assert_eq!(entries[1]["ok"], true);
    assert_eq!(entries[1]["manifestId"], "notes");
}

#[test]
fn scan_without_directory_or_config_fails() {
    let home = tempfile::tempdir().expect("should create temp dir");
    warden(home.path()).arg("scan").assert().failure();
}

#[test]
fn serve_answers_one_line_per_request() {
    let home = tempfile::tempdir().expect("should create temp dir");
    let input = concat!(
        r#"{"id":"1","cmd":"cache.set","payload":{"key":"k","value":3},"meta":{"source":"kernel"}}"#,
        "\n",
        r#"{"id":"2","cmd":"cache.get","payload":{"key":"k"},"meta":{"source":"kernel"}}"#,
        "\n",
        "not json\n",
        r#"{"id":"4","cmd":"nope.cmd","meta":{"source":"kernel"}}"#,
        "\n",
    );
    let output = warden(home.path())
        .arg("serve")
        .write_stdin(input)
        .output()
        .expect("serve should run");
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let lines: Vec<Value> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("response line is JSON"))
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["id"], "1");
    assert_eq!(lines[0]["ok"], true);
    assert_eq!(lines[1]["result"]["value"], 3);
    assert_eq!(lines[2]["error"]["code"], "INVALID_ENVELOPE");
    assert_eq!(lines[3]["id"], "4");
    assert_eq!(lines[3]["error"]["code"], "UNKNOWN_COMMAND_PREFIX");
}
