//! Storage adapters implementing `cohort_store::Storage`.
//!
//! - `fs`: Local filesystem, rooted at a directory (default).
//! - `memory`: Process-local map, for tests and `memory://` URIs.
//!
//! `build_storage_from_uri` picks the backend from a cache or checkpoint URI
//! (`file:///var/cohort`, a bare path, or `memory://`).

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use std::sync::Arc;

use cohort_core::config::{file_uri_to_path, uri_scheme};
use cohort_store::Storage;

use crate::error::{Error, Result};

/// Build the storage backend a URI points at.
pub fn build_storage_from_uri(uri: &str) -> Result<Arc<dyn Storage>> {
    match uri_scheme(uri) {
        Some("memory") | Some("mem") => Ok(Arc::new(MemoryStorage::new())),
        Some("file") | None => {
            let root = file_uri_to_path(uri);
            if root.trim().is_empty() {
                return Err(Error::Config(format!("empty storage path in '{uri}'")));
            }
            Ok(Arc::new(FsStorage::new(root)))
        }
        Some(other) => Err(Error::Config(format!(
            "unsupported storage scheme '{other}' (expected file:// or memory://)"
        ))),
    }
}
