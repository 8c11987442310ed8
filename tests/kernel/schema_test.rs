//! Schema declarations and validator binding.

use serde_json::json;
use warden::config::KernelConfig;
use warden::kernel::loader::RegistrationRequest;
use warden::kernel::manifest::ModuleManifest;
use warden::kernel::permission::Permission;
use warden::kernel::schema::builtin_validator;

use crate::support::{kernel, kernel_with, payloads, records, TestModule};

fn declare(kernel: &warden::kernel::Kernel, id: &str, key: &str, permissions: &[Permission]) {
    let description = format!("declared by {id}");
    let manifest = ModuleManifest::new(id, "1.0.0")
        .with_permissions(permissions)
        .with_schema(key, Some(description.as_str()));
    kernel
        .loader()
        .register(RegistrationRequest::declared(manifest, TestModule::new(id)))
        .expect("register");
}

#[test]
fn first_declaration_wins() {
    let (_clock, kernel) = kernel();
    declare(&kernel, "alpha", "shared.event", &[]);
    declare(&kernel, "beta", "shared.event", &[]);

    let snapshot = kernel.schemas().snapshot();
    assert_eq!(snapshot.declarations.len(), 1);
    assert_eq!(snapshot.declarations[0].owner, "alpha");
    assert_eq!(
        snapshot.declarations[0].description.as_deref(),
        Some("declared by alpha")
    );
    assert!(kernel.schemas().is_declared("shared.event"));
    assert!(!kernel.schemas().is_declared("other.event"));
}

#[test]
fn binding_an_undeclared_key_fails() {
    let (_clock, kernel) = kernel();
    let err = kernel
        .schemas()
        .bind_validator(
            "ghost.event",
            builtin_validator("payload:object").expect("builtin"),
            "kernel",
        )
        .expect_err("undeclared");
    assert_eq!(err.code(), "SCHEMA_CONTRACT_ERROR");
    let reports = payloads(&kernel, "diagnostic:schema_undeclared");
    assert_eq!(reports, vec![json!({ "key": "ghost.event", "source": "kernel" })]);
}

#[test]
fn module_binding_requires_schema_register() {
    let (_clock, kernel) = kernel();
    declare(&kernel, "alpha", "alpha.update", &[]);
    let err = kernel
        .schemas()
        .bind_validator(
            "alpha.update",
            builtin_validator("payload:object").expect("builtin"),
            "alpha",
        )
        .expect_err("no schema.register");
    assert_eq!(err.code(), "PERMISSION_ERROR");
    assert_eq!(kernel.schemas().snapshot().bound_validators, 0);
    let violations = payloads(&kernel, "diagnostic:permission_violation");
    assert_eq!(violations[0]["permission"], "schema.register");
}

#[test]
fn granted_binding_is_enforced_on_emit() {
    let mut config = KernelConfig::default();
    config.bus.enable_schema_validation = true;
    let (_clock, kernel) = kernel_with(config);
    declare(&kernel, "alpha", "alpha.update", &[Permission::SchemaRegister]);

    kernel
        .schemas()
        .bind_validator(
            "alpha.update",
            builtin_validator("example:schema").expect("builtin"),
            "alpha",
        )
        .expect("bind");
    assert_eq!(kernel.schemas().snapshot().bound_validators, 1);
    assert_eq!(kernel.bus().schema_count(), 1);

    assert!(kernel
        .bus()
        .emit("alpha.update", json!({ "ok": 1 }), "alpha")
        .is_err());
    kernel
        .bus()
        .emit("alpha.update", json!({ "ok": false }), "alpha")
        .expect("valid");
    assert_eq!(records(&kernel, "alpha.update").len(), 1);
    assert_eq!(payloads(&kernel, "diagnostic:schema_violation").len(), 1);
}

#[test]
fn rebinding_counts_each_key_once() {
    let (_clock, kernel) = kernel();
    declare(&kernel, "alpha", "alpha.update", &[]);
    for id in ["payload:object", "payload:non_null"] {
        kernel
            .schemas()
            .bind_validator("alpha.update", builtin_validator(id).expect("builtin"), "kernel")
            .expect("kernel binds");
    }
    assert_eq!(kernel.schemas().snapshot().bound_validators, 1);
}

#[test]
fn builtin_validators_behave() {
    let object = builtin_validator("payload:object").expect("builtin");
    assert!(object(&json!({})).is_ok());
    assert!(object(&json!([1])).is_err());

    let non_null = builtin_validator("payload:non_null").expect("builtin");
    assert!(non_null(&json!(0)).is_ok());
    assert!(non_null(&json!(null)).is_err());

    assert!(builtin_validator("no.such.validator").is_none());
}
