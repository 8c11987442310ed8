//! Permission-gated cache over the host store.

use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::{json, Value};
use warden::config::KernelConfig;
use warden::host::{HostAdapter, HostStore};
use warden::kernel::cache::MAX_VALUE_DEPTH;
use warden::kernel::permission::Permission;
use warden::kernel::Kernel;

use crate::support::{kernel, payloads};

struct BrokenStore;

#[async_trait(?Send)]
impl HostStore for BrokenStore {
    async fn get(&self, _key: &str) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("disk unavailable")
    }

    async fn set(&self, _key: &str, _value: Value) -> anyhow::Result<()> {
        anyhow::bail!("disk unavailable")
    }

    fn key_count(&self) -> usize {
        0
    }
}

fn grant_storage(kernel: &Kernel, id: &str) {
    kernel
        .permissions()
        .grant(id, &[Permission::StorageRead, Permission::StorageWrite])
        .expect("grant");
}

#[tokio::test]
async fn round_trips_with_permissions() {
    let (_clock, kernel) = kernel();
    grant_storage(&kernel, "notes");
    let cache = kernel.cache();

    assert_eq!(cache.get("draft", "notes").await.expect("get"), None);
    cache
        .set("draft", &json!({ "title": "hello", "tags": ["a", "b"] }), "notes")
        .await
        .expect("set");
    assert_eq!(
        cache.get("draft", "notes").await.expect("get"),
        Some(json!({ "title": "hello", "tags": ["a", "b"] }))
    );

    cache.set("draft", &42, "notes").await.expect("overwrite");
    assert_eq!(cache.size(), 1);
}

#[tokio::test]
async fn kernel_needs_no_grant() {
    let (_clock, kernel) = kernel();
    kernel
        .cache()
        .set("boot", &"ok", "kernel")
        .await
        .expect("kernel write");
    assert_eq!(
        kernel.cache().get("boot", "kernel").await.expect("kernel read"),
        Some(json!("ok"))
    );
}

#[tokio::test]
async fn missing_permissions_are_rejected_and_reported() {
    let (_clock, kernel) = kernel();
    kernel
        .permissions()
        .grant("reader", &[Permission::StorageRead])
        .expect("grant");

    let err = kernel
        .cache()
        .set("secret", &1, "reader")
        .await
        .expect_err("no storage.write");
    assert_eq!(err.code(), "PERMISSION_ERROR");
    let err = kernel
        .cache()
        .get("secret", "stranger")
        .await
        .expect_err("no storage.read");
    assert_eq!(err.code(), "PERMISSION_ERROR");

    let violations = payloads(&kernel, "diagnostic:permission_violation");
    assert_eq!(violations.len(), 2);
    assert_eq!(violations[0]["permission"], "storage.write");
    assert_eq!(violations[0]["action"], "cache.set");
    assert_eq!(violations[1]["permission"], "storage.read");
    assert_eq!(violations[1]["target"], "secret");
    assert_eq!(kernel.cache().size(), 0);
}

#[tokio::test]
async fn unrepresentable_values_leave_no_trace() {
    let (_clock, kernel) = kernel();
    grant_storage(&kernel, "notes");

    let mut tuple_keys = BTreeMap::new();
    tuple_keys.insert(vec![1u8, 2], "value");
    let err = kernel
        .cache()
        .set("tuple", &tuple_keys, "notes")
        .await
        .expect_err("non-string map keys");
    assert_eq!(err.code(), "CACHE_ERROR");

    let mut deep = json!(null);
    for _ in 0..=MAX_VALUE_DEPTH {
        deep = json!({ "next": deep });
    }
    let err = kernel
        .cache()
        .set("deep", &deep, "notes")
        .await
        .expect_err("too deep");
    assert_eq!(err.code(), "CACHE_ERROR");

    let err = kernel
        .cache()
        .set("", &1, "notes")
        .await
        .expect_err("empty key");
    assert_eq!(err.code(), "CACHE_ERROR");

    assert_eq!(kernel.cache().size(), 0);
    assert_eq!(kernel.cache().get("tuple", "notes").await.expect("get"), None);
    assert_eq!(kernel.cache().get("deep", "notes").await.expect("get"), None);
}

#[tokio::test]
async fn store_failures_become_cache_errors() {
    let kernel = Kernel::builder(KernelConfig::default())
        .host(HostAdapter {
            store: Rc::new(BrokenStore),
            fs: None,
        })
        .build()
        .expect("kernel");

    let err = kernel
        .cache()
        .set("k", &1, "kernel")
        .await
        .expect_err("write fails");
    assert_eq!(err.code(), "CACHE_ERROR");
    assert!(err.to_string().contains("disk unavailable"));
    assert!(kernel.cache().get("k", "kernel").await.is_err());
    assert_eq!(kernel.cache().size(), 0);
}

#[tokio::test]
async fn size_follows_store_eviction() {
    let (_clock, kernel) = kernel();
    let cache = kernel.cache();
    for i in 0..1001 {
        cache
            .set(&format!("k{i}"), &i, "kernel")
            .await
            .expect("set");
    }
    assert_eq!(cache.size(), 1000);
    assert_eq!(cache.get("k0", "kernel").await.expect("get"), None);
    assert_eq!(cache.get("k1000", "kernel").await.expect("get"), Some(json!(1000)));
    assert_eq!(kernel.snapshotter().snapshot().cache.map(|c| c.size), Some(1000));
}
