//! Permission-gated key-value cache in front of a [`HostStore`].
//!
//! Values are converted to JSON before the backing store is touched, so a
//! value that cannot be represented (non-string map keys, a failing
//! `Serialize` impl, pathological nesting) is rejected without side effects.

use std::rc::Rc;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::host::{HostStore, MemoryStore};
use crate::kernel::error::KernelError;
use crate::kernel::permission::{Permission, PermissionContext, PermissionSystem};

/// Deepest nesting accepted in a cached value.
pub const MAX_VALUE_DEPTH: usize = 128;

/// Default key capacity when no host store is injected.
pub const DEFAULT_MAX_KEYS: usize = 1000;

/// Cache facade used by modules and the bridge.
pub struct CacheStore {
    permissions: Rc<PermissionSystem>,
    store: Rc<dyn HostStore>,
}

impl CacheStore {
    /// Create a cache over `store`, or over a bounded in-memory store.
    pub fn new(permissions: Rc<PermissionSystem>, store: Option<Rc<dyn HostStore>>) -> Self {
        let store = store.unwrap_or_else(|| Rc::new(MemoryStore::new(DEFAULT_MAX_KEYS)));
        Self { permissions, store }
    }

    /// Read `key` on behalf of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] without `storage.read`,
    /// [`KernelError::Cache`] for an empty key or a failing store.
    pub async fn get(&self, key: &str, source: &str) -> Result<Option<Value>, KernelError> {
        self.permissions.assert(
            source,
            Permission::StorageRead,
            &PermissionContext::new("cache.get").with_target(key),
        )?;
        require_key(key)?;
        self.store
            .get(key)
            .await
            .map_err(|e| KernelError::Cache(format!("store read failed for \"{key}\": {e:#}")))
    }

    /// Write `value` under `key` on behalf of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Permission`] without `storage.write`,
    /// [`KernelError::Cache`] for an empty key, a value that cannot be
    /// represented as JSON, or a failing store.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        source: &str,
    ) -> Result<(), KernelError> {
        self.permissions.assert(
            source,
            Permission::StorageWrite,
            &PermissionContext::new("cache.set").with_target(key),
        )?;
        require_key(key)?;
        let value = serde_json::to_value(value).map_err(|e| {
            KernelError::Cache(format!("value for \"{key}\" is not serializable: {e}"))
        })?;
        check_depth(&value, key)?;
        self.store
            .set(key, value)
            .await
            .map_err(|e| KernelError::Cache(format!("store write failed for \"{key}\": {e:#}")))?;
        debug!(key, source, "cache entry written");
        Ok(())
    }

    /// Number of keys held by the backing store.
    pub fn size(&self) -> usize {
        self.store.key_count()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

fn require_key(key: &str) -> Result<(), KernelError> {
    if key.is_empty() {
        return Err(KernelError::Cache("cache key must not be empty".to_owned()));
    }
    Ok(())
}

/// Iterative walk so deep values cannot overflow the stack.
fn check_depth(value: &Value, key: &str) -> Result<(), KernelError> {
    let mut stack: Vec<(&Value, usize)> = vec![(value, 0)];
    while let Some((node, depth)) = stack.pop() {
        if depth > MAX_VALUE_DEPTH {
            return Err(KernelError::Cache(format!(
                "value for \"{key}\" nests deeper than {MAX_VALUE_DEPTH} levels"
            )));
        }
        let next = depth.saturating_add(1);
        match node {
            Value::Array(items) => stack.extend(items.iter().map(|item| (item, next))),
            Value::Object(map) => stack.extend(map.values().map(|item| (item, next))),
            _ => {}
        }
    }
    Ok(())
}
