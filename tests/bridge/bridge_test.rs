//! Bridge commands dispatched through the kernel's transport.

use std::rc::Rc;

use serde_json::{json, Value};
use warden::bridge::{CommandMeta, KernelTransport, TransportResponse};
use warden::config::KernelConfig;
use warden::host::{HostAdapter, MemoryFs, MemoryStore};
use warden::kernel::clock::ManualClock;
use warden::kernel::Kernel;
use warden::modules::{builtin_catalog, ticker_manifest, TICKER_ID};

use crate::support::{payloads, records, START_MS};

fn kernel_with_fs() -> (Rc<MemoryFs>, Kernel) {
    let fs = Rc::new(MemoryFs::default());
    let kernel = Kernel::builder(KernelConfig::default())
        .clock(Rc::new(ManualClock::new(START_MS)))
        .host(HostAdapter {
            store: Rc::new(MemoryStore::new(100)),
            fs: Some(fs.clone()),
        })
        .catalog(Rc::new(builtin_catalog()))
        .build()
        .expect("kernel should wire");
    (fs, kernel)
}

async fn call(kernel: &Kernel, cmd: &str, payload: Value, source: &str) -> TransportResponse {
    kernel
        .transport()
        .request(cmd, payload, &CommandMeta::new(source))
        .await
}

fn result(response: TransportResponse) -> Value {
    assert!(response.ok, "unexpected failure: {:?}", response.error);
    response.result.expect("result present")
}

#[tokio::test]
async fn snapshot_is_served_and_takes_no_payload() {
    let (_fs, kernel) = kernel_with_fs();
    let snapshot = result(call(&kernel, "kernel.snapshot.get", Value::Null, "kernel").await);
    assert_eq!(snapshot["meta"]["version"], "kernel-seed");
    assert!(snapshot["eventBus"]["historyTail"].is_array());

    let response = call(&kernel, "kernel.snapshot.get", json!({ "full": true }), "kernel").await;
    assert_eq!(response.error_code(), Some("KERNEL_BRIDGE_ERROR"));
}

#[tokio::test]
async fn event_emit_uses_meta_source() {
    let (_fs, kernel) = kernel_with_fs();
    let response = call(
        &kernel,
        "event.emit",
        json!({ "name": "notes.saved", "payload": { "id": 7 } }),
        "notes",
    )
    .await;
    assert_eq!(result(response), json!({ "ok": true }));
    let saved = records(&kernel, "notes.saved");
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].source, "notes");
    assert_eq!(saved[0].payload, json!({ "id": 7 }));

    let missing = call(&kernel, "event.emit", json!({ "payload": {} }), "notes").await;
    assert_eq!(missing.error_code(), Some("KERNEL_BRIDGE_ERROR"));
    let reserved = call(
        &kernel,
        "event.emit",
        json!({ "name": "kernel:boot", "payload": {} }),
        "notes",
    )
    .await;
    assert_eq!(reserved.error_code(), Some("EVENT_CONTRACT_ERROR"));
}

#[tokio::test]
async fn catalog_module_runs_through_its_lifecycle() {
    let (_fs, kernel) = kernel_with_fs();
    let manifest = serde_json::to_value(ticker_manifest()).expect("manifest json");
    let registered = call(
        &kernel,
        "module.register",
        json!({ "definition": { "manifest": manifest, "module": TICKER_ID } }),
        "kernel",
    )
    .await;
    assert_eq!(result(registered), json!({ "ok": true, "id": TICKER_ID }));

    let started = call(&kernel, "module.start", json!({ "id": TICKER_ID }), "kernel").await;
    assert_eq!(result(started), json!({ "ok": true, "state": "running" }));

    for _ in 0..3 {
        result(call(&kernel, "event.emit", json!({ "name": "kernel.tick", "payload": {} }), "kernel").await);
    }

    let stopped = call(
        &kernel,
        "module.stop",
        json!({ "id": TICKER_ID, "reason": "maintenance" }),
        "kernel",
    )
    .await;
    assert_eq!(result(stopped), json!({ "ok": true, "state": "stopped" }));
    assert_eq!(payloads(&kernel, "ticker.stopped"), vec![json!({ "ok": true, "ticks": 3 })]);
}

#[tokio::test]
async fn register_accepts_bare_catalog_name() {
    let (_fs, kernel) = kernel_with_fs();
    let response = call(&kernel, "module.register", json!({ "module": TICKER_ID }), "kernel").await;
    assert_eq!(result(response)["id"], TICKER_ID);
    assert!(kernel.loader().snapshot()[0].manifest.is_none());
}

#[tokio::test]
async fn register_is_kernel_only_and_checks_its_payload() {
    let (_fs, kernel) = kernel_with_fs();

    let response = call(&kernel, "module.register", json!({ "module": TICKER_ID }), "notes").await;
    assert_eq!(response.error_code(), Some("KERNEL_BRIDGE_ERROR"));
    assert!(response
        .error
        .as_ref()
        .is_some_and(|e| e.message.contains("restricted to the kernel")));

    let unknown = call(&kernel, "module.register", json!({ "module": "ghost" }), "kernel").await;
    assert_eq!(unknown.error_code(), Some("KERNEL_BRIDGE_ERROR"));

    let malformed = call(
        &kernel,
        "module.register",
        json!({ "manifest": { "id": TICKER_ID, "version": 5 }, "module": TICKER_ID }),
        "kernel",
    )
    .await;
    assert_eq!(malformed.error_code(), Some("MANIFEST_ERROR"));
    let reports = payloads(&kernel, "diagnostic:manifest_invalid");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["moduleId"], TICKER_ID);
    assert!(kernel.loader().module_ids().is_empty());
}

#[tokio::test]
async fn lifecycle_commands_need_kernel_control() {
    let (_fs, kernel) = kernel_with_fs();
    result(call(&kernel, "module.register", json!({ "module": TICKER_ID }), "kernel").await);

    let denied = call(&kernel, "module.start", json!({ "id": TICKER_ID }), "ops").await;
    assert_eq!(denied.error_code(), Some("PERMISSION_ERROR"));

    kernel
        .permissions()
        .grant("ops", &[warden::kernel::permission::Permission::KernelControl])
        .expect("grant");
    result(call(&kernel, "module.start", json!({ "id": TICKER_ID }), "ops").await);
    let isolated = call(&kernel, "module.isolate", json!({ "id": TICKER_ID }), "ops").await;
    assert_eq!(result(isolated)["state"], "isolated");
    let reset = call(&kernel, "module.reset", json!({ "id": TICKER_ID }), "ops").await;
    assert_eq!(result(reset)["state"], "registered");

    let empty_id = call(&kernel, "module.start", json!({ "id": "" }), "kernel").await;
    assert_eq!(empty_id.error_code(), Some("KERNEL_BRIDGE_ERROR"));
    let not_running = call(&kernel, "module.stop", json!({ "id": TICKER_ID }), "kernel").await;
    assert_eq!(not_running.error_code(), Some("MODULE_LIFECYCLE_ERROR"));
}

#[tokio::test]
async fn cache_commands_round_trip() {
    let (_fs, kernel) = kernel_with_fs();
    let set = call(
        &kernel,
        "cache.set",
        json!({ "key": "greeting", "value": ["hi", 1] }),
        "kernel",
    )
    .await;
    assert_eq!(result(set), json!({ "ok": true }));

    let got = call(&kernel, "cache.get", json!({ "key": "greeting" }), "kernel").await;
    assert_eq!(result(got), json!({ "value": ["hi", 1] }));
    let absent = call(&kernel, "cache.get", json!({ "key": "nothing" }), "kernel").await;
    assert_eq!(result(absent), json!({ "value": null }));

    let no_value = call(&kernel, "cache.set", json!({ "key": "k" }), "kernel").await;
    assert_eq!(no_value.error_code(), Some("KERNEL_BRIDGE_ERROR"));
    let denied = call(&kernel, "cache.get", json!({ "key": "greeting" }), "notes").await;
    assert_eq!(denied.error_code(), Some("PERMISSION_ERROR"));
}

#[tokio::test]
async fn bind_validator_by_builtin_id() {
    let (_fs, kernel) = kernel_with_fs();
    let manifest = json!({
        "id": TICKER_ID,
        "version": "1.0.0",
        "schemas": [{ "key": "ticker.started" }],
    });
    result(
        call(
            &kernel,
            "module.register",
            json!({ "manifest": manifest, "module": TICKER_ID }),
            "kernel",
        )
        .await,
    );

    let unknown = call(
        &kernel,
        "schema.bindValidator",
        json!({ "key": "ticker.started", "validatorId": "nope" }),
        "kernel",
    )
    .await;
    assert_eq!(unknown.error_code(), Some("KERNEL_BRIDGE_ERROR"));

    let undeclared = call(
        &kernel,
        "schema.bindValidator",
        json!({ "key": "ticker.other", "validatorId": "payload:object" }),
        "kernel",
    )
    .await;
    assert_eq!(undeclared.error_code(), Some("SCHEMA_CONTRACT_ERROR"));

    let bound = call(
        &kernel,
        "schema.bindValidator",
        json!({ "key": "ticker.started", "validatorId": "payload:object" }),
        "kernel",
    )
    .await;
    assert_eq!(result(bound), json!({ "ok": true }));
    assert_eq!(kernel.schemas().snapshot().bound_validators, 1);
}

#[tokio::test]
async fn scan_reports_each_manifest() {
    let (fs, kernel) = kernel_with_fs();
    fs.insert_file(
        "/mods/alpha/manifest.json",
        r#"{"id":"alpha","version":"1.0.0","permissions":["storage.read"]}"#,
    );
    fs.insert_file("/mods/beta/manifest.json", r#"{"id":"beta","version":"one"}"#);
    fs.insert_file("/mods/gamma/manifest.json", "{ not json");
    fs.insert_file("/mods/delta/readme.txt", "no manifest here");

    let report = result(call(&kernel, "host.modules.scan", json!({ "baseDir": "/mods" }), "kernel").await);
    assert_eq!(
        report,
        json!([
            { "manifestPath": "/mods/alpha/manifest.json", "ok": true, "manifestId": "alpha" },
            {
                "manifestPath": "/mods/beta/manifest.json",
                "ok": false,
                "error": "invalid manifest: manifest version \"one\" is invalid",
            },
            {
                "manifestPath": "/mods/gamma/manifest.json",
                "ok": false,
                "error": report[2]["error"].clone(),
            },
        ])
    );
    assert!(report[2]["error"]
        .as_str()
        .is_some_and(|e| e.starts_with("JSON parse error")));
    assert!(kernel.loader().module_ids().is_empty(), "scan never registers");
    assert_eq!(payloads(&kernel, "diagnostic:manifest_invalid").len(), 1);
}

#[tokio::test]
async fn scan_of_missing_directory_is_empty() {
    let (_fs, kernel) = kernel_with_fs();
    let report = result(call(&kernel, "host.modules.scan", json!({ "baseDir": "/nowhere" }), "kernel").await);
    assert_eq!(report, json!([]));
}

#[tokio::test]
async fn scan_needs_kernel_and_host() {
    let (_fs, kernel) = kernel_with_fs();
    let response = call(&kernel, "host.modules.scan", json!({ "baseDir": "/mods" }), "notes").await;
    assert_eq!(response.error_code(), Some("KERNEL_BRIDGE_ERROR"));

    let hostless = Kernel::new(KernelConfig::default()).expect("kernel");
    assert!(!hostless.bridge().can_scan());
    let response = call(&hostless, "host.modules.scan", json!({ "baseDir": "/mods" }), "kernel").await;
    assert_eq!(response.error_code(), Some("KERNEL_BRIDGE_ERROR"));
    assert!(response
        .error
        .as_ref()
        .is_some_and(|e| e.message.contains("requires a host adapter")));
}

#[tokio::test]
async fn dispatch_requires_a_source() {
    let (_fs, kernel) = kernel_with_fs();
    let err = kernel
        .bridge()
        .dispatch("kernel.snapshot.get", Value::Null, &CommandMeta::new(""))
        .await
        .expect_err("empty source");
    assert_eq!(err.code(), "KERNEL_BRIDGE_ERROR");
    let err = kernel
        .bridge()
        .dispatch("kernel.reboot", Value::Null, &CommandMeta::kernel())
        .await
        .expect_err("unknown command");
    assert!(err.to_string().contains("unknown command"));
}
