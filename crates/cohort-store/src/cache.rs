//! Content-addressed response cache.
//!
//! An in-memory index fronts an optional persistent backend. Lookups take a
//! read lock on the index only; backend I/O never happens under the lock, so a
//! `get` is never held up by a `put` for another key. Two concurrent misses for
//! the same key both generate; the last `put` wins.
//!
//! Backend failures (I/O, corrupt records) are logged and counted, then treated
//! as misses. The cache never fails a simulation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use cohort_core::types::{CacheEntry, CacheKey};

use crate::codec::Codec;
use crate::record::{self, RecordKind};
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub backend_errors: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Backend {
    storage: Arc<dyn Storage>,
    prefix: String,
    codec: Codec,
}

impl Backend {
    /// `{prefix}/ab/abcdef….entry`, fanned out on the first key byte.
    fn path(&self, key: &CacheKey) -> String {
        let hex = key.to_hex();
        format!("{}/{}/{}.entry", self.prefix, &hex[..2], hex)
    }
}

pub struct CacheStore {
    index: RwLock<HashMap<CacheKey, CacheEntry>>,
    backend: Option<Backend>,
    hits: AtomicU64,
    misses: AtomicU64,
    backend_errors: AtomicU64,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CacheStore {
    /// Process-local cache with no persistence.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            backend: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Cache that reads through and writes through to `storage` under `prefix`.
    pub fn with_backend(storage: Arc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self::with_backend_codec(storage, prefix, Codec::None)
    }

    pub fn with_backend_codec(
        storage: Arc<dyn Storage>,
        prefix: impl Into<String>,
        codec: Codec,
    ) -> Self {
        let mut store = Self::in_memory();
        store.backend = Some(Backend {
            storage,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            codec,
        });
        store
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let cached = self
            .index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned();

        let found = match cached {
            Some(entry) => Some(entry),
            None => self.read_backend(key),
        };

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or overwrite the entry for `entry.key`.
    pub fn put(&self, entry: CacheEntry) {
        if let Some(backend) = &self.backend {
            let path = backend.path(&entry.key);
            let written = serde_json::to_vec(&entry)
                .map_err(crate::error::Error::from)
                .and_then(|json| record::encode(RecordKind::CacheEntry, backend.codec, &json))
                .and_then(|framed| backend.storage.write(&path, &framed));
            if let Err(e) = written {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %entry.key, path = %path, error = %e, "cache write-through failed");
            }
        }

        self.index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry.key, entry);
    }

    /// True when lookups may read and writes always write a storage backend.
    pub fn is_persistent(&self) -> bool {
        self.backend.is_some()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }

    /// Zero the hit/miss counters; entries are kept.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.backend_errors.store(0, Ordering::Relaxed);
    }

    fn read_backend(&self, key: &CacheKey) -> Option<CacheEntry> {
        let backend = self.backend.as_ref()?;
        let path = backend.path(key);

        let bytes = match backend.storage.read(&path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, path = %path, error = %e, "cache backend read failed; treating as miss");
                return None;
            }
        };

        let decoded = record::decode(&path, RecordKind::CacheEntry, &bytes).and_then(|json| {
            serde_json::from_slice::<CacheEntry>(&json).map_err(crate::error::Error::from)
        });
        match decoded {
            Ok(entry) if entry.key == *key => {
                self.index
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(*key, entry.clone());
                Some(entry)
            }
            Ok(entry) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, stored = %entry.key, path = %path, "cache record holds a different key; ignoring");
                None
            }
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %key, path = %path, error = %e, "unreadable cache record; treating as miss");
                None
            }
        }
    }
}
