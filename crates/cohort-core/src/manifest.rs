//! Run manifest for audit/replay.
//!
//! Every `SimulationResult` carries one. It records what was run (model,
//! sampling params, per-wave task-set fingerprints) and when, so two results
//! can be compared for provenance.

use serde::{Deserialize, Serialize};

use crate::hash::Hash256;
use crate::id::{RunId, WaveNumber};
use crate::types::SamplingParams;

/// blake3 over a wave's expanded task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveFingerprint {
    pub wave: WaveNumber,
    pub tasks: usize,
    pub hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: RunId,

    pub model: String,

    pub sampling: SamplingParams,

    /// One entry per wave that was expanded during this run (resumed runs included).
    pub waves: Vec<WaveFingerprint>,

    /// Engine version string for provenance.
    pub engine_version: String,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunManifest {
    pub fn new(run_id: RunId, model: String, sampling: SamplingParams, started_ms: u64) -> Self {
        Self {
            run_id,
            model,
            sampling,
            waves: Vec::new(),
            engine_version: crate::VERSION.to_string(),
            started_ms,
            finished_ms: started_ms,
        }
    }

    /// Record a wave fingerprint, replacing an earlier one for the same wave.
    pub fn record_wave(&mut self, fp: WaveFingerprint) {
        self.waves.retain(|w| w.wave != fp.wave);
        self.waves.push(fp);
        self.waves.sort_by_key(|w| w.wave);
    }

    pub fn fingerprint(&self, wave: WaveNumber) -> Option<&WaveFingerprint> {
        self.waves.iter().find(|w| w.wave == wave)
    }

    pub fn finish(mut self, finished_ms: u64) -> Self {
        self.finished_ms = finished_ms;
        self
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
