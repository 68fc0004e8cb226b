//! Durable run snapshot.
//!
//! A checkpoint is the only state that must survive a process restart. It holds
//! the run request itself, so `resume` needs nothing but the checkpoint store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{EntityId, RunId, TaskId, WaveNumber};
use crate::manifest::RunManifest;
use crate::types::{outcome_list, ConversationTurn, OutcomeMap, RunRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// `wave` is executing; `remaining_task_ids` still need an outcome.
    Running,
    /// `wave` has every outcome recorded and its memory updates applied.
    Committed,
}

/// Outcomes recorded so far, across all waves of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    #[serde(with = "outcome_list")]
    pub outcomes: OutcomeMap,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: RunId,
    pub wave: WaveNumber,
    pub phase: CheckpointPhase,
    /// Tasks of `wave` with a recorded outcome.
    pub completed_task_ids: BTreeSet<TaskId>,
    /// Tasks of `wave` still to be submitted.
    pub remaining_task_ids: BTreeSet<TaskId>,
    pub partial_result: PartialResult,
    pub committed_waves: Vec<WaveNumber>,
    /// Conversation memory as of the last committed wave.
    pub memory: BTreeMap<EntityId, Vec<ConversationTurn>>,
    pub request: RunRequest,
    pub manifest: RunManifest,
    pub saved_at_ms: u64,
}

impl Checkpoint {
    /// Check the structural invariants before a checkpoint is trusted.
    ///
    /// - completed and remaining sets are disjoint
    /// - every completed id has an outcome for `wave` in the partial result
    /// - a committed wave has nothing remaining
    pub fn validate(&self) -> Result<()> {
        if let Some(id) = self
            .completed_task_ids
            .intersection(&self.remaining_task_ids)
            .next()
        {
            return Err(Error::Checkpoint(format!(
                "{id} is both completed and remaining"
            )));
        }
        for id in &self.completed_task_ids {
            match self.partial_result.outcomes.get(id) {
                Some(o) if o.wave == self.wave => {}
                Some(o) => {
                    return Err(Error::Checkpoint(format!(
                        "{id} recorded under {} but checkpoint is for {}",
                        o.wave, self.wave
                    )))
                }
                None => {
                    return Err(Error::Checkpoint(format!(
                        "{id} marked completed without an outcome"
                    )))
                }
            }
        }
        if self.phase == CheckpointPhase::Committed && !self.remaining_task_ids.is_empty() {
            return Err(Error::Checkpoint(format!(
                "{} committed with {} tasks remaining",
                self.wave,
                self.remaining_task_ids.len()
            )));
        }
        Ok(())
    }

    /// All task ids of `wave` covered by this checkpoint.
    pub fn wave_task_ids(&self) -> BTreeSet<TaskId> {
        self.completed_task_ids
            .union(&self.remaining_task_ids)
            .copied()
            .collect()
    }

    pub fn is_committed(&self, wave: WaveNumber) -> bool {
        self.committed_waves.contains(&wave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::types::{OutcomeStatus, SamplingParams, TaskOutcome};

    fn outcome(id: u64, wave: u64) -> TaskOutcome {
        TaskOutcome {
            task_id: TaskId::new(id),
            entity_id: EntityId::new("e"),
            wave: WaveNumber::new(wave),
            prompt_id: "p".into(),
            status: OutcomeStatus::Success {
                response_text: "ok".into(),
                cached: false,
                attempts: 1,
                token_count: None,
            },
        }
    }

    fn checkpoint() -> Checkpoint {
        let run_id = RunId::new_random();
        Checkpoint {
            run_id,
            wave: WaveNumber::FIRST,
            phase: CheckpointPhase::Running,
            completed_task_ids: [TaskId::new(0)].into_iter().collect(),
            remaining_task_ids: [TaskId::new(1)].into_iter().collect(),
            partial_result: PartialResult {
                outcomes: [(TaskId::new(0), outcome(0, 1))].into_iter().collect(),
            },
            committed_waves: vec![],
            memory: BTreeMap::new(),
            request: RunRequest {
                entities: vec![],
                waves: vec![],
                sampling: SamplingParams::default(),
                config: RunConfig::default(),
            },
            manifest: RunManifest::new(run_id, "m".into(), SamplingParams::default(), 0),
            saved_at_ms: 0,
        }
    }

    #[test]
    fn valid_checkpoint_passes() {
        let ck = checkpoint();
        ck.validate().unwrap();
        assert_eq!(ck.wave_task_ids().len(), 2);
    }

    #[test]
    fn overlapping_sets_are_rejected() {
        let mut ck = checkpoint();
        ck.remaining_task_ids.insert(TaskId::new(0));
        assert!(ck.validate().is_err());
    }

    #[test]
    fn completed_without_outcome_is_rejected() {
        let mut ck = checkpoint();
        ck.completed_task_ids.insert(TaskId::new(5));
        assert!(ck.validate().is_err());
    }

    #[test]
    fn committed_with_remaining_is_rejected() {
        let mut ck = checkpoint();
        ck.phase = CheckpointPhase::Committed;
        assert!(ck.validate().is_err());
    }

    #[test]
    fn json_round_trip_preserves_outcomes() {
        let ck = checkpoint();
        let json = serde_json::to_string(&ck).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ck);
    }
}
