//! Deterministic replay & provenance helpers.
//!
//! A wave's fingerprint hashes the identity of every expanded task (id, entity,
//! prompt id, cache key). Identical requests and identical prior memory produce
//! identical fingerprints, which is what makes resuming a wave safe.

use serde::Serialize;

use cohort_core::hash::hash_serde;
use cohort_core::id::{EntityId, TaskId, WaveNumber};
use cohort_core::manifest::{RunManifest, WaveFingerprint};
use cohort_core::types::{CacheKey, Task};

use crate::ExecError;

#[derive(Serialize)]
struct TaskIdentity<'a> {
    task_id: TaskId,
    entity_id: &'a EntityId,
    prompt_id: &'a str,
    cache_key: CacheKey,
}

/// Hash the task set of one wave.
pub fn hash_task_set(wave: WaveNumber, tasks: &[Task]) -> Result<WaveFingerprint, ExecError> {
    let identities: Vec<TaskIdentity<'_>> = tasks
        .iter()
        .map(|t| TaskIdentity {
            task_id: t.task_id,
            entity_id: &t.entity_id,
            prompt_id: &t.prompt_id,
            cache_key: t.cache_key,
        })
        .collect();
    let hash = hash_serde(&(wave, &identities)).map_err(|e| ExecError::Hash(e.to_string()))?;
    Ok(WaveFingerprint {
        wave,
        tasks: tasks.len(),
        hash,
    })
}

/// Compare a rebuilt wave against the fingerprint recorded before interruption.
/// A wave with no recorded fingerprint is accepted.
pub fn verify_fingerprint(manifest: &RunManifest, fp: &WaveFingerprint) -> Result<(), ExecError> {
    match manifest.fingerprint(fp.wave) {
        Some(recorded) if recorded != fp => Err(ExecError::ResumeMismatch(format!(
            "{} rebuilt as {} tasks ({}) but checkpoint recorded {} tasks ({})",
            fp.wave, fp.tasks, fp.hash, recorded.tasks, recorded.hash
        ))),
        _ => Ok(()),
    }
}
