//! Host capabilities the kernel consumes: a key-value store and a read-only
//! filesystem view.
//!
//! The kernel never touches the outside world directly. Embedders hand it a
//! [`HostAdapter`] built from an in-memory host (tests, selfcheck) or the
//! local filesystem host (CLI).

pub mod discovery;
pub mod local;
pub mod memory;

use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;

pub use discovery::{discover_modules, DiscoveredModule};
pub use local::LocalFs;
pub use memory::{MemoryFs, MemoryStore};

/// Key-value persistence used by the cache.
#[async_trait(?Send)]
pub trait HostStore {
    /// Read `key`. `Ok(None)` when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store fails.
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>>;

    /// Write `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store fails.
    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()>;

    /// Number of keys the store currently holds.
    fn key_count(&self) -> usize;
}

/// Read-only filesystem view used for module discovery.
#[async_trait(?Send)]
pub trait HostFs {
    /// Entry names directly under `path`, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be read.
    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<String>>;

    /// Contents of the UTF-8 file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    async fn read_text_file(&self, path: &str) -> anyhow::Result<String>;

    /// Whether anything exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error when existence cannot be determined.
    async fn exists(&self, path: &str) -> anyhow::Result<bool>;
}

/// Capabilities handed to the kernel.
#[derive(Clone)]
pub struct HostAdapter {
    /// Store backing the cache.
    pub store: Rc<dyn HostStore>,
    /// Filesystem for module discovery. `None` disables scanning.
    pub fs: Option<Rc<dyn HostFs>>,
}

impl HostAdapter {
    /// Bounded in-memory store and an empty in-memory filesystem.
    pub fn memory(max_keys: usize) -> Self {
        Self {
            store: Rc::new(MemoryStore::new(max_keys)),
            fs: Some(Rc::new(MemoryFs::default())),
        }
    }

    /// Bounded in-memory store plus the local filesystem.
    pub fn local(max_keys: usize) -> Self {
        Self {
            store: Rc::new(MemoryStore::new(max_keys)),
            fs: Some(Rc::new(LocalFs)),
        }
    }
}

impl std::fmt::Debug for HostAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAdapter")
            .field("fs", &self.fs.is_some())
            .finish_non_exhaustive()
    }
}
