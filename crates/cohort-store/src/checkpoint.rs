//! Durable checkpoint store keyed by run id.
//!
//! Each run owns exactly one object, `{root}/{run_id}.ckpt`, holding the JSON
//! checkpoint inside a checksummed record. `save` replaces it atomically (the
//! `Storage` contract), so a crash mid-save leaves the previous checkpoint.

use std::sync::Arc;

use cohort_core::checkpoint::Checkpoint;
use cohort_core::id::RunId;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::record::{self, RecordKind};
use crate::storage::Storage;

const EXTENSION: &str = ".ckpt";

pub struct CheckpointStore {
    storage: Arc<dyn Storage>,
    root: String,
    codec: Codec,
}

impl CheckpointStore {
    pub fn new(storage: Arc<dyn Storage>, root: impl Into<String>) -> Self {
        Self::with_codec(storage, root, Codec::None)
    }

    pub fn with_codec(storage: Arc<dyn Storage>, root: impl Into<String>, codec: Codec) -> Self {
        Self {
            storage,
            root: root.into().trim_end_matches('/').to_string(),
            codec,
        }
    }

    pub fn path_for(&self, run_id: &RunId) -> String {
        if self.root.is_empty() {
            format!("{run_id}{EXTENSION}")
        } else {
            format!("{}/{run_id}{EXTENSION}", self.root)
        }
    }

    /// Validate, serialize, and atomically replace the checkpoint for its run.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.validate()?;
        let json = serde_json::to_vec(checkpoint)?;
        let framed = record::encode(RecordKind::Checkpoint, self.codec, &json)?;
        let path = self.path_for(&checkpoint.run_id);
        self.storage.write(&path, &framed)?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            wave = %checkpoint.wave,
            phase = ?checkpoint.phase,
            completed = checkpoint.completed_task_ids.len(),
            remaining = checkpoint.remaining_task_ids.len(),
            bytes = framed.len(),
            "checkpoint saved"
        );
        Ok(())
    }

    /// Load the latest checkpoint for `run_id`.
    ///
    /// `Error::NotFound` if none exists; `Error::Corrupt` if the record fails
    /// its checksum, does not parse, or violates the checkpoint invariants.
    pub fn load(&self, run_id: &RunId) -> Result<Checkpoint> {
        let path = self.path_for(run_id);
        let bytes = self
            .storage
            .read(&path)?
            .ok_or_else(|| Error::NotFound(format!("checkpoint for run {run_id}")))?;

        let corrupt = |reason: String| Error::Corrupt {
            path: path.clone(),
            reason,
        };

        let json = record::decode(&path, RecordKind::Checkpoint, &bytes)?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&json).map_err(|e| corrupt(e.to_string()))?;
        if checkpoint.run_id != *run_id {
            return Err(corrupt(format!(
                "holds run {} instead of {run_id}",
                checkpoint.run_id
            )));
        }
        checkpoint.validate().map_err(|e| corrupt(e.to_string()))?;
        Ok(checkpoint)
    }

    pub fn exists(&self, run_id: &RunId) -> Result<bool> {
        self.storage.exists(&self.path_for(run_id))
    }

    /// Idempotent.
    pub fn delete(&self, run_id: &RunId) -> Result<()> {
        self.storage.delete(&self.path_for(run_id))
    }

    /// Run ids with a stored checkpoint. Unparseable names are skipped.
    pub fn list(&self) -> Result<Vec<RunId>> {
        let mut ids: Vec<RunId> = self
            .storage
            .list(&self.root)?
            .iter()
            .filter_map(|p| {
                let name = p.rsplit('/').next()?;
                RunId::parse(name.strip_suffix(EXTENSION)?).ok()
            })
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
