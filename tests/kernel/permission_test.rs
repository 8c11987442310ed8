//! Permission grants, the kernel sentinel and violation reporting.

use serde_json::json;
use warden::kernel::permission::{Permission, PermissionContext, VIOLATION_DEDUP_WINDOW_MS};

use crate::support::{kernel, payloads};

#[test]
fn permission_tokens_parse() {
    for permission in Permission::ALL {
        let parsed: Permission = permission.as_str().parse().expect("known token");
        assert_eq!(parsed, permission);
    }
    assert_eq!(Permission::EmitReserved.as_str(), "event.emit_reserved");
    assert!("storage.delete".parse::<Permission>().is_err());
}

#[test]
fn kernel_holds_everything_and_is_immutable() {
    let (_clock, kernel) = kernel();
    let permissions = kernel.permissions();
    for permission in Permission::ALL {
        assert!(permissions.has("kernel", permission));
    }
    let err = permissions
        .grant("kernel", &[Permission::StorageRead])
        .expect_err("kernel grant");
    assert_eq!(err.code(), "PERMISSION_ERROR");
    assert!(permissions
        .revoke("kernel", &[Permission::StorageRead])
        .is_err());
}

#[test]
fn invalid_ids_are_rejected() {
    let (_clock, kernel) = kernel();
    let permissions = kernel.permissions();
    assert!(permissions.grant("Bad Id", &[Permission::StorageRead]).is_err());
    assert!(permissions.grant("", &[Permission::StorageRead]).is_err());
    let err = permissions
        .assert("Bad Id", Permission::StorageRead, &PermissionContext::new("cache.get"))
        .expect_err("invalid id");
    assert_eq!(err.code(), "PERMISSION_ERROR");
    assert!(payloads(&kernel, "diagnostic:permission_violation").is_empty());
}

#[test]
fn grants_are_additive_and_revocable() {
    let (_clock, kernel) = kernel();
    let permissions = kernel.permissions();
    permissions
        .grant("notes", &[Permission::StorageWrite])
        .expect("grant");
    permissions
        .grant("notes", &[Permission::StorageRead])
        .expect("grant");
    assert!(permissions.has("notes", Permission::StorageRead));
    assert!(permissions.has("notes", Permission::StorageWrite));
    assert_eq!(
        permissions.permissions_of("notes"),
        vec![Permission::StorageRead, Permission::StorageWrite]
    );

    permissions
        .revoke("notes", &[Permission::StorageWrite])
        .expect("revoke");
    assert!(!permissions.has("notes", Permission::StorageWrite));
    assert_eq!(permissions.permissions_of("notes"), vec![Permission::StorageRead]);
    assert!(permissions.permissions_of("stranger").is_empty());
}

#[test]
fn missing_grant_reports_violation() {
    let (_clock, kernel) = kernel();
    let err = kernel
        .permissions()
        .assert(
            "notes",
            Permission::StorageRead,
            &PermissionContext::new("cache.get").with_target("secret"),
        )
        .expect_err("not granted");
    assert_eq!(err.code(), "PERMISSION_ERROR");
    assert!(err.to_string().contains("storage.read"));

    let violations = payloads(&kernel, "diagnostic:permission_violation");
    assert_eq!(violations.len(), 1);
    let violation = &violations[0];
    assert_eq!(violation["moduleId"], "notes");
    assert_eq!(violation["permission"], "storage.read");
    assert_eq!(violation["action"], "cache.get");
    assert_eq!(violation["target"], "secret");
    assert_eq!(violation["eventName"], json!(null));
    assert_eq!(violation["timestamp"], crate::support::START_MS);
}

#[test]
fn repeated_violations_are_deduplicated_within_window() {
    let (clock, kernel) = kernel();
    let permissions = kernel.permissions();
    let ctx = PermissionContext::new("cache.get").with_target("k");
    for _ in 0..5 {
        assert!(permissions.assert("notes", Permission::StorageRead, &ctx).is_err());
    }
    assert_eq!(payloads(&kernel, "diagnostic:permission_violation").len(), 1);

    let other_target = PermissionContext::new("cache.get").with_target("other");
    assert!(permissions
        .assert("notes", Permission::StorageRead, &other_target)
        .is_err());
    assert_eq!(payloads(&kernel, "diagnostic:permission_violation").len(), 2);

    clock.advance(VIOLATION_DEDUP_WINDOW_MS);
    assert!(permissions.assert("notes", Permission::StorageRead, &ctx).is_err());
    assert_eq!(payloads(&kernel, "diagnostic:permission_violation").len(), 3);
}

#[test]
fn granted_assert_is_silent() {
    let (_clock, kernel) = kernel();
    let permissions = kernel.permissions();
    permissions
        .grant("ops", &[Permission::KernelControl])
        .expect("grant");
    permissions
        .assert("ops", Permission::KernelControl, &PermissionContext::new("module.stop"))
        .expect("granted");
    permissions
        .assert("kernel", Permission::TelemetryRead, &PermissionContext::new("snapshot"))
        .expect("kernel");
    assert!(payloads(&kernel, "diagnostic:permission_violation").is_empty());
}
