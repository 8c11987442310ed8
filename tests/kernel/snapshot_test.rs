//! Kernel snapshots.

use serde_json::json;
use warden::kernel::loader::RegistrationRequest;
use warden::kernel::manifest::ModuleManifest;
use warden::kernel::permission::Permission;
use warden::kernel::snapshot::{HISTORY_TAIL, SNAPSHOT_VERSION};

use crate::support::{kernel, TestModule, START_MS};

#[test]
fn fresh_kernel_snapshot() {
    let (clock, kernel) = kernel();
    clock.advance(250);
    let snapshot = kernel.snapshotter().snapshot();

    assert_eq!(snapshot.meta.version, SNAPSHOT_VERSION);
    assert_eq!(snapshot.meta.timestamp, START_MS + 250);
    assert_eq!(snapshot.meta.uptime_ms, 250);
    assert!(snapshot.modules.is_empty());
    assert!(snapshot.event_bus.history_tail.is_empty());
    assert_eq!(snapshot.event_bus.counts.listener_count, 4);
    assert_eq!(snapshot.event_bus.counts.queued, 0);
    assert!(snapshot.watchdog.is_some());
    assert_eq!(snapshot.cache.map(|c| c.size), Some(0));
}

#[test]
fn modules_carry_their_last_transition() {
    let (clock, kernel) = kernel();
    let manifest = ModuleManifest::new("notes", "2.0.0")
        .with_permissions(&[Permission::StorageRead])
        .with_schema("notes.saved", None);
    kernel
        .loader()
        .register(RegistrationRequest::declared(manifest, TestModule::new("notes")))
        .expect("register");
    clock.advance(10);
    kernel.loader().start("notes").expect("start");

    let snapshot = kernel.snapshotter().snapshot();
    assert_eq!(snapshot.modules.len(), 1);
    let module = &snapshot.modules[0];
    assert_eq!(module.id, "notes");
    assert_eq!(module.state, "running");
    let summary = module.manifest.as_ref().expect("manifest summary");
    assert_eq!((summary.permissions_count, summary.schemas_count), (1, 1));
    let last = module.last_lifecycle_transition.as_ref().expect("transition");
    assert_eq!(last.prev_state, "registered");
    assert_eq!(last.next_state, "running");
    assert_eq!(last.reason, "start");
    assert_eq!(last.timestamp, START_MS + 10);
    assert_eq!(snapshot.schemas.declarations.len(), 1);
}

#[test]
fn history_tail_is_bounded_and_ordered() {
    let (_clock, kernel) = kernel();
    for i in 0..60 {
        kernel
            .bus()
            .emit("kernel.count", json!({ "i": i }), "kernel")
            .expect("emit");
    }
    let snapshot = kernel.snapshotter().snapshot();
    let tail = &snapshot.event_bus.history_tail;
    assert_eq!(tail.len(), HISTORY_TAIL);
    assert_eq!(tail[0].payload["i"], 60 - HISTORY_TAIL);
    assert_eq!(tail[HISTORY_TAIL - 1].payload["i"], 59);
    assert_eq!(snapshot.event_bus.counts.total_history, 60);
}

#[tokio::test]
async fn cache_values_are_never_exposed() {
    let (_clock, kernel) = kernel();
    kernel
        .cache()
        .set("token", &"hunter2", "kernel")
        .await
        .expect("set");
    let snapshot = kernel.snapshotter().snapshot();
    assert_eq!(snapshot.cache.map(|c| c.size), Some(1));

    let encoded = serde_json::to_string(&snapshot).expect("serialize");
    assert!(!encoded.contains("hunter2"));
    assert!(encoded.contains("\"eventBus\""));
    assert!(encoded.contains("\"uptimeMs\""));
}
