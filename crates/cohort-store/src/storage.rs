//! Abstract byte storage used by the cache and checkpoint stores.
//!
//! Implemented by `cohort-io::FsStorage` for the local filesystem and by
//! `cohort-io::MemoryStorage` for tests and ephemeral runs.

use crate::error::Result;

pub trait Storage: Send + Sync {
    /// Replace the object at `path` with `bytes`.
    ///
    /// Must be atomic from a reader's point of view: a concurrent or later
    /// `read` sees either the previous content or all of `bytes`, never a prefix.
    /// Creates parent directories if needed.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read the whole object. `Ok(None)` if it does not exist.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a path. Idempotent (no error if path doesn't exist).
    fn delete(&self, path: &str) -> Result<()>;

    /// List all paths under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path)?.is_some())
    }
}
