//! Store I/O run on tokio's blocking pool.
//!
//! Cache and checkpoint backends do synchronous file I/O (reads, fsync,
//! rename). Every backend touch from async code goes through here. A purely
//! in-memory cache is called inline.

use std::sync::Arc;

use cohort_core::checkpoint::Checkpoint;
use cohort_core::id::RunId;
use cohort_core::types::{CacheEntry, CacheKey};
use cohort_store::{CacheStore, CheckpointStore};

pub(crate) async fn cache_get(cache: &Arc<CacheStore>, key: CacheKey) -> Option<CacheEntry> {
    if !cache.is_persistent() {
        return cache.get(&key);
    }
    let cache = Arc::clone(cache);
    match tokio::task::spawn_blocking(move || cache.get(&key)).await {
        Ok(found) => found,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "cache lookup task failed; treating as miss");
            None
        }
    }
}

pub(crate) async fn cache_put(cache: &Arc<CacheStore>, entry: CacheEntry) {
    if !cache.is_persistent() {
        cache.put(entry);
        return;
    }
    let key = entry.key;
    let cache = Arc::clone(cache);
    if let Err(e) = tokio::task::spawn_blocking(move || cache.put(entry)).await {
        tracing::warn!(key = %key, error = %e, "cache write task failed");
    }
}

/// Serialize and write `checkpoint` off the runtime.
pub(crate) async fn checkpoint_save(
    store: &Arc<CheckpointStore>,
    checkpoint: Checkpoint,
) -> Result<(), cohort_store::Error> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.save(&checkpoint))
        .await
        .map_err(|e| cohort_store::Error::Storage(format!("checkpoint writer failed: {e}")))?
}

pub(crate) async fn checkpoint_delete(
    store: &Arc<CheckpointStore>,
    run_id: RunId,
) -> Result<(), cohort_store::Error> {
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || store.delete(&run_id))
        .await
        .map_err(|e| cohort_store::Error::Storage(format!("checkpoint delete failed: {e}")))?
}
