//! In-memory host: an LRU-bounded store and a path-keyed file map.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;

use super::{HostFs, HostStore};

/// Key-value store that evicts the least recently written key once more
/// than `max_keys` are held.
#[derive(Debug)]
pub struct MemoryStore {
    max_keys: usize,
    entries: RefCell<IndexMap<String, Value>>,
}

impl MemoryStore {
    /// Create a store holding at most `max_keys` (minimum 1) keys.
    pub fn new(max_keys: usize) -> Self {
        Self {
            max_keys: max_keys.max(1),
            entries: RefCell::new(IndexMap::new()),
        }
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    fn insert(&self, key: &str, value: Value) {
        let mut entries = self.entries.borrow_mut();
        entries.shift_remove(key);
        entries.insert(key.to_owned(), value);
        while entries.len() > self.max_keys {
            entries.shift_remove_index(0);
        }
    }
}

#[async_trait(?Send)]
impl HostStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn key_count(&self) -> usize {
        self.len()
    }
}

/// Filesystem view over an in-memory map of `/`-separated paths to file
/// contents. Directories exist implicitly when a file lives beneath them.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: RefCell<BTreeMap<String, String>>,
}

impl MemoryFs {
    /// Add or replace a file.
    pub fn insert_file(&self, path: &str, contents: &str) {
        self.files
            .borrow_mut()
            .insert(normalize(path), contents.to_owned());
    }
}

#[async_trait(?Send)]
impl HostFs for MemoryFs {
    async fn list_dir(&self, path: &str) -> anyhow::Result<Vec<String>> {
        let prefix = format!("{}/", normalize(path));
        let names: BTreeSet<String> = self
            .files
            .borrow()
            .keys()
            .filter_map(|file| file.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_owned)
            .collect();
        if names.is_empty() {
            anyhow::bail!("no such directory: {path}");
        }
        Ok(names.into_iter().collect())
    }

    async fn read_text_file(&self, path: &str) -> anyhow::Result<String> {
        self.files
            .borrow()
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such file: {path}"))
    }

    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        let path = normalize(path);
        let prefix = format!("{path}/");
        let files = self.files.borrow();
        Ok(files.contains_key(&path) || files.keys().any(|file| file.starts_with(&prefix)))
    }
}

fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_owned()
}
