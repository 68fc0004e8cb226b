//! Wave orchestrator.
//!
//! State machine per run:
//! `Pending(w) -> Running(w) -> Committed(w) -> Pending(w+1) -> ... -> Done`,
//! or `Aborted(w)` when a wave that requires full success has a terminal
//! failure, or a `Fatal` error stops the executor.
//!
//! Tasks for wave `w` are built from each entity's memory as of the end of
//! wave `w-1`. Memory for `w` is appended only after every task of `w` has an
//! outcome, one requester turn and one responder turn per entity, so the next
//! wave is the first to see it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cohort_core::checkpoint::{Checkpoint, CheckpointPhase, PartialResult};
use cohort_core::id::{EntityId, RunId, TaskId, WaveNumber};
use cohort_core::manifest::{now_millis, RunManifest};
use cohort_core::types::{
    ConversationTurn, ErrorKind, OutcomeMap, Role, RunRequest, RunStatus, TaskOutcome,
};
use cohort_planner::plan_wave;
use cohort_store::{CheckpointStore, ConversationStore};

use crate::executor::{CheckpointHook, RunHooks, TaskExecutor};
use crate::offload;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::replay::{hash_task_set, verify_fingerprint};
use crate::runtime::ExecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveState {
    Pending(WaveNumber),
    Running(WaveNumber),
    Committed(WaveNumber),
    Done,
    Aborted(WaveNumber),
}

/// Run-level state carried across waves; everything a checkpoint needs.
#[derive(Debug, Clone)]
pub struct RunProgress {
    pub run_id: RunId,
    pub request: RunRequest,
    pub manifest: RunManifest,
    pub outcomes: OutcomeMap,
    pub committed: Vec<WaveNumber>,
}

impl RunProgress {
    pub fn new(run_id: RunId, request: RunRequest) -> Self {
        let manifest = RunManifest::new(
            run_id,
            request.config.model.clone(),
            request.sampling.clone(),
            now_millis(),
        );
        Self {
            run_id,
            request,
            manifest,
            outcomes: OutcomeMap::new(),
            committed: Vec::new(),
        }
    }

    /// Rebuild from a checkpoint. Returns the progress, the first wave to run,
    /// and the memory snapshot to restore.
    ///
    /// `Fatal`/`Internal` failures of the checkpointed wave are dropped so the
    /// affected tasks are submitted again; every other recorded outcome is kept.
    pub fn resume_from(
        ck: Checkpoint,
    ) -> (Self, WaveNumber, BTreeMap<EntityId, Vec<ConversationTurn>>) {
        let mut outcomes = ck.partial_result.outcomes;
        outcomes.retain(|_, o| {
            !(o.wave == ck.wave
                && matches!(o.error_kind(), Some(ErrorKind::Fatal | ErrorKind::Internal)))
        });
        let start = match ck.phase {
            CheckpointPhase::Committed => ck.wave.next(),
            CheckpointPhase::Running => ck.wave,
        };
        let progress = Self {
            run_id: ck.run_id,
            request: ck.request,
            manifest: ck.manifest,
            outcomes,
            committed: ck.committed_waves,
        };
        (progress, start, ck.memory)
    }

    fn checkpoint(
        &self,
        wave: WaveNumber,
        phase: CheckpointPhase,
        wave_ids: &BTreeSet<TaskId>,
        extra: Option<&OutcomeMap>,
        remaining: &BTreeSet<TaskId>,
        memory: BTreeMap<EntityId, Vec<ConversationTurn>>,
    ) -> Checkpoint {
        let mut outcomes = self.outcomes.clone();
        if let Some(extra) = extra {
            outcomes.extend(extra.iter().map(|(k, v)| (*k, v.clone())));
        }
        Checkpoint {
            run_id: self.run_id,
            wave,
            phase,
            completed_task_ids: wave_ids.difference(remaining).copied().collect(),
            remaining_task_ids: remaining.clone(),
            partial_result: PartialResult { outcomes },
            committed_waves: self.committed.clone(),
            memory,
            request: self.request.clone(),
            manifest: self.manifest.clone(),
            saved_at_ms: now_millis(),
        }
    }
}

/// Adapter the executor calls on its cadence.
struct WaveCheckpointer<'a> {
    store: &'a Arc<CheckpointStore>,
    run: &'a RunProgress,
    memory: &'a ConversationStore,
    wave: WaveNumber,
    wave_ids: &'a BTreeSet<TaskId>,
}

#[async_trait]
impl<'a> CheckpointHook for WaveCheckpointer<'a> {
    async fn save(
        &mut self,
        wave_outcomes: &OutcomeMap,
        remaining: &BTreeSet<TaskId>,
    ) -> Result<(), cohort_store::Error> {
        let ck = self.run.checkpoint(
            self.wave,
            CheckpointPhase::Running,
            self.wave_ids,
            Some(wave_outcomes),
            remaining,
            self.memory.snapshot(),
        );
        offload::checkpoint_save(self.store, ck).await
    }
}

pub struct WaveOrchestrator {
    executor: TaskExecutor,
    memory: Arc<ConversationStore>,
    checkpoints: Option<Arc<CheckpointStore>>,
}

impl WaveOrchestrator {
    pub fn new(
        executor: TaskExecutor,
        memory: Arc<ConversationStore>,
        checkpoints: Option<Arc<CheckpointStore>>,
    ) -> Self {
        Self {
            executor,
            memory,
            checkpoints,
        }
    }

    pub fn memory(&self) -> &Arc<ConversationStore> {
        &self.memory
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Run every wave from `start` on. Returns how the run ended; `Err` only
    /// for problems that make the run itself unusable (invalid plan, resume
    /// mismatch, memory ordering violation).
    pub async fn run_waves(
        &self,
        run: &mut RunProgress,
        start: WaveNumber,
        cancel: &CancellationToken,
        progress: &ProgressSink,
    ) -> Result<RunStatus, ExecError> {
        let waves: Vec<(WaveNumber, bool)> = run
            .request
            .waves
            .iter()
            .filter(|w| w.wave >= start && !run.committed.contains(&w.wave))
            .map(|w| (w.wave, w.require_full_success))
            .collect();

        for (wave, require_full_success) in waves {
            if cancel.is_cancelled() {
                self.transition(run, WaveState::Pending(wave));
                self.save(run, wave, CheckpointPhase::Running, None).await;
                return Ok(RunStatus::Cancelled { wave });
            }

            self.transition(run, WaveState::Pending(wave));
            let tasks = plan_wave(&run.request, wave, |e| self.memory.read_before(e, wave))?;
            let fingerprint = hash_task_set(wave, &tasks)?;
            verify_fingerprint(&run.manifest, &fingerprint)?;
            run.manifest.record_wave(fingerprint);

            let wave_ids: BTreeSet<TaskId> = tasks.iter().map(|t| t.task_id).collect();
            let pending: Vec<_> = tasks
                .into_iter()
                .filter(|t| !run.outcomes.contains_key(&t.task_id))
                .collect();
            progress.emit(ProgressEvent::WaveStarted {
                wave,
                tasks: wave_ids.len(),
                already_done: wave_ids.len() - pending.len(),
            });

            self.transition(run, WaveState::Running(wave));
            let remaining: BTreeSet<TaskId> = pending.iter().map(|t| t.task_id).collect();
            self.save(run, wave, CheckpointPhase::Running, Some((&wave_ids, &remaining))).await;

            let report = {
                let mut hook = self.checkpoints.as_ref().map(|store| WaveCheckpointer {
                    store,
                    run: &*run,
                    memory: &self.memory,
                    wave,
                    wave_ids: &wave_ids,
                });
                let hooks = RunHooks {
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                    checkpoint: hook.as_mut().map(|h| h as &mut dyn CheckpointHook),
                };
                self.executor
                    .run(pending, run.request.config.concurrency_limit, hooks)
                    .await
            };
            run.outcomes.extend(report.outcomes);
            self.executor.metrics().emit_summary(&run.run_id, wave);

            if let Some((task_id, err)) = report.fatal {
                self.transition(run, WaveState::Aborted(wave));
                self.save(run, wave, CheckpointPhase::Running, Some((&wave_ids, &report.remaining))).await;
                return Ok(RunStatus::Aborted {
                    wave,
                    reason: format!("fatal error on {task_id}: {}", err.message),
                });
            }

            if !report.complete {
                tracing::info!(run_id = %run.run_id, wave = %wave, remaining = report.remaining.len(), "run cancelled");
                return Ok(RunStatus::Cancelled { wave });
            }

            let failed = run
                .outcomes
                .values()
                .filter(|o| o.wave == wave && !o.is_success())
                .count();
            if require_full_success && failed > 0 {
                self.transition(run, WaveState::Aborted(wave));
                self.save(run, wave, CheckpointPhase::Running, Some((&wave_ids, &BTreeSet::new()))).await;
                return Ok(RunStatus::Aborted {
                    wave,
                    reason: format!("{failed} task(s) failed in a wave that requires full success"),
                });
            }

            self.commit(run, wave)?;
            run.committed.push(wave);
            self.transition(run, WaveState::Committed(wave));
            self.save(run, wave, CheckpointPhase::Committed, Some((&wave_ids, &BTreeSet::new()))).await;
            progress.emit(ProgressEvent::WaveCommitted { wave });
        }

        self.transition(run, WaveState::Done);
        Ok(RunStatus::Completed)
    }

    /// Append one requester and one responder turn per entity with at least
    /// one successful task in `wave`. Prompts and responses are joined in
    /// prompt order.
    fn commit(&self, run: &RunProgress, wave: WaveNumber) -> Result<(), ExecError> {
        let Some(def) = run.request.waves.iter().find(|w| w.wave == wave) else {
            return Ok(());
        };

        let mut by_entity: BTreeMap<&EntityId, Vec<&TaskOutcome>> = BTreeMap::new();
        for o in run.outcomes.values() {
            if o.wave == wave && o.is_success() {
                by_entity.entry(&o.entity_id).or_default().push(o);
            }
        }

        for entity in &run.request.entities {
            let Some(outcomes) = by_entity.get(&entity.id) else {
                continue;
            };
            let mut questions = Vec::with_capacity(outcomes.len());
            let mut answers = Vec::with_capacity(outcomes.len());
            for o in outcomes {
                let question = def
                    .prompts
                    .iter()
                    .find(|p| p.id == o.prompt_id)
                    .map(|p| p.text.as_str())
                    .unwrap_or(o.prompt_id.as_str());
                questions.push(question);
                answers.push(o.response_text().unwrap_or_default());
            }

            let timestamp_ms = now_millis();
            self.memory.append(
                &entity.id,
                ConversationTurn {
                    role: Role::Requester,
                    content: questions.join("\n\n"),
                    wave,
                    timestamp_ms,
                },
            )?;
            self.memory.append(
                &entity.id,
                ConversationTurn {
                    role: Role::Responder,
                    content: answers.join("\n\n"),
                    wave,
                    timestamp_ms,
                },
            )?;
        }
        Ok(())
    }

    fn transition(&self, run: &RunProgress, state: WaveState) {
        tracing::info!(run_id = %run.run_id, state = ?state, "wave state");
    }

    /// Best-effort checkpoint. `ids` is `(wave task ids, remaining)`; `None`
    /// means the wave has not been planned yet.
    async fn save(
        &self,
        run: &RunProgress,
        wave: WaveNumber,
        phase: CheckpointPhase,
        ids: Option<(&BTreeSet<TaskId>, &BTreeSet<TaskId>)>,
    ) {
        let Some(store) = self.checkpoints.as_ref() else {
            return;
        };
        let empty = BTreeSet::new();
        let (wave_ids, remaining) = ids.unwrap_or((&empty, &empty));
        let ck = run.checkpoint(wave, phase, wave_ids, None, remaining, self.memory.snapshot());
        match offload::checkpoint_save(store, ck).await {
            Ok(()) => self.executor.metrics().record_checkpoint(),
            Err(e) => {
                tracing::warn!(run_id = %run.run_id, wave = %wave, phase = ?phase, error = %e, "checkpoint save failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use cohort_core::config::RunConfig;
    use cohort_core::types::{
        EntitySnapshot, OutcomeStatus, PromptSpec, SamplingParams, WaveDefinition,
    };
    use cohort_store::CacheStore;

    use super::*;
    use crate::client::{Generation, GenerationClient, GenerationError, GenerationRequest};

    /// Answers with the last line of the prompt; refuses prompts mentioning "refuse".
    struct LastLine;

    #[async_trait]
    impl GenerationClient for LastLine {
        async fn generate(
            &self,
            request: &GenerationRequest,
            _timeout: Duration,
        ) -> Result<Generation, GenerationError> {
            let last = request.prompt.lines().last().unwrap_or_default();
            if last.contains("refuse") {
                return Err(GenerationError::malformed("empty body"));
            }
            Ok(Generation::new(format!("re: {last}")))
        }
    }

    fn request(waves: Vec<WaveDefinition>) -> RunRequest {
        RunRequest {
            entities: vec![
                EntitySnapshot::new("a", json!({"age": 30})),
                EntitySnapshot::new("b", json!({"age": 40})),
            ],
            waves,
            sampling: SamplingParams::default(),
            config: RunConfig {
                concurrency_limit: 2,
                ..RunConfig::default()
            },
        }
    }

    fn orchestrator() -> WaveOrchestrator {
        let executor = TaskExecutor::new(
            Arc::new(LastLine),
            Arc::new(CacheStore::in_memory()),
            &RunConfig::default(),
        );
        WaveOrchestrator::new(executor, Arc::new(ConversationStore::new()), None)
    }

    #[tokio::test]
    async fn later_waves_see_committed_memory() {
        let orch = orchestrator();
        let mut run = RunProgress::new(
            RunId::new_random(),
            request(vec![
                WaveDefinition::new(1, vec![PromptSpec::new("q1", "Do you cook?"), PromptSpec::new("q2", "Do you bake?")]),
                WaveDefinition::new(2, vec![PromptSpec::new("q3", "Still cooking?")]),
            ]),
        );
        let status = orch
            .run_waves(&mut run, WaveNumber::FIRST, &CancellationToken::new(), &ProgressSink::none())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(run.committed, vec![WaveNumber::new(1), WaveNumber::new(2)]);
        assert_eq!(run.outcomes.len(), 6);

        let turns = orch.memory().read(&EntityId::new("a"));
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[0].role, Role::Requester);
        assert_eq!(turns[0].content, "Do you cook?\n\nDo you bake?");
        assert_eq!(turns[1].content, "re: Do you cook?\n\nre: Do you bake?");
        assert_eq!(turns[3].wave, WaveNumber::new(2));

        // One fingerprint per wave.
        assert_eq!(run.manifest.waves.len(), 2);
        let fp1 = run.manifest.fingerprint(WaveNumber::new(1)).unwrap();
        assert_eq!(fp1.tasks, 4);
    }

    #[tokio::test]
    async fn failed_required_wave_aborts_without_commit() {
        let orch = orchestrator();
        let mut run = RunProgress::new(
            RunId::new_random(),
            request(vec![
                WaveDefinition::new(1, vec![PromptSpec::new("q1", "Please refuse")]),
                WaveDefinition::new(2, vec![PromptSpec::new("q2", "never asked")]),
            ]),
        );
        let status = orch
            .run_waves(&mut run, WaveNumber::FIRST, &CancellationToken::new(), &ProgressSink::none())
            .await
            .unwrap();
        assert!(matches!(status, RunStatus::Aborted { wave, .. } if wave == WaveNumber::FIRST));
        assert!(run.committed.is_empty());
        assert!(orch.memory().snapshot().is_empty());
        assert_eq!(run.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn optional_wave_commits_partial_memory() {
        let orch = orchestrator();
        let mut wave = WaveDefinition::new(
            1,
            vec![PromptSpec::new("ok", "Hello"), PromptSpec::new("bad", "Please refuse")],
        );
        wave.require_full_success = false;
        let mut run = RunProgress::new(RunId::new_random(), request(vec![wave]));
        let status = orch
            .run_waves(&mut run, WaveNumber::FIRST, &CancellationToken::new(), &ProgressSink::none())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        let turns = orch.memory().read(&EntityId::new("b"));
        assert_eq!(turns[0].content, "Hello");
        assert_eq!(turns[1].content, "re: Hello");
    }

    #[test]
    fn resume_drops_fatal_outcomes_of_the_open_wave() {
        let run_id = RunId::new_random();
        let mut run = RunProgress::new(
            run_id,
            request(vec![WaveDefinition::new(1, vec![PromptSpec::new("q", "Hi")])]),
        );
        let wave = WaveNumber::FIRST;
        for (id, status) in [
            (0, OutcomeStatus::Success { response_text: "x".into(), cached: false, attempts: 1, token_count: None }),
            (1, OutcomeStatus::Failed { kind: ErrorKind::Fatal, reason: "401".into(), attempts: 1 }),
        ] {
            run.outcomes.insert(
                TaskId::new(id),
                TaskOutcome {
                    task_id: TaskId::new(id),
                    entity_id: EntityId::new("a"),
                    wave,
                    prompt_id: "q".into(),
                    status,
                },
            );
        }
        let ids: BTreeSet<TaskId> = [TaskId::new(0), TaskId::new(1)].into_iter().collect();
        let ck = run.checkpoint(
            wave,
            CheckpointPhase::Running,
            &ids,
            None,
            &BTreeSet::new(),
            BTreeMap::new(),
        );
        ck.validate().unwrap();

        let (resumed, start, memory) = RunProgress::resume_from(ck);
        assert_eq!(start, wave);
        assert!(memory.is_empty());
        assert_eq!(resumed.outcomes.len(), 1);
        assert!(resumed.outcomes.contains_key(&TaskId::new(0)));
    }

    #[test]
    fn resume_after_commit_starts_at_next_wave() {
        let run = RunProgress::new(
            RunId::new_random(),
            request(vec![WaveDefinition::new(1, vec![PromptSpec::new("q", "Hi")])]),
        );
        let ck = run.checkpoint(
            WaveNumber::FIRST,
            CheckpointPhase::Committed,
            &BTreeSet::new(),
            None,
            &BTreeSet::new(),
            BTreeMap::new(),
        );
        let (_, start, _) = RunProgress::resume_from(ck);
        assert_eq!(start, WaveNumber::new(2));
    }
}
