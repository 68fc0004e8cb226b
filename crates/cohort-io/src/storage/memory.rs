//! In-memory storage backend.
//!
//! Backs the `memory://` URI scheme and tests that should not touch the
//! filesystem. Clones share one map.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cohort_store::error::Result as StoreResult;
use cohort_store::Storage;

#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pre-populate or overwrite raw bytes (used by tests to plant corrupt records).
    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.data().insert(path.into(), bytes);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.data().contains_key(path)
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.data().values().map(Vec::len).sum()
    }
}

impl Storage for MemoryStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        self.data().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.data().get(path).cloned())
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        self.data().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .data()
            .range(prefix.to_string()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &str) -> StoreResult<bool> {
        Ok(self.contains(path))
    }
}
