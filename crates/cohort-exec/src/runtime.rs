//! Simulation engine: the public entry point over the orchestrator.
//!
//! Each run is spawned onto the ambient tokio runtime and tracked in a small
//! registry keyed by `RunId`. Results are published through a `watch` channel
//! so `result` is a non-blocking peek and `wait` is a cheap await.
//!
//! The response cache is shared by every run of an engine; conversation memory
//! is per run.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use cohort_core::id::{EntityId, RunId, WaveNumber};
use cohort_core::manifest::now_millis;
use cohort_core::types::{ConversationTurn, RunRequest, RunStatus, SimulationResult};
use cohort_planner::{validate_request, StudyError};
use cohort_store::{CacheStore, CheckpointStore, ConversationStore};

use crate::client::GenerationClient;
use crate::executor::TaskExecutor;
use crate::offload;
use crate::orchestrator::{RunProgress, WaveOrchestrator};
use crate::progress::ProgressSink;

type MemorySnapshot = BTreeMap<EntityId, Vec<ConversationTurn>>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid request: {0}")]
    Invalid(#[from] StudyError),
    #[error("store: {0}")]
    Store(#[from] cohort_store::Error),
    #[error("hashing error: {0}")]
    Hash(String),
    #[error("resume mismatch: {0}")]
    ResumeMismatch(String),
    #[error("unknown run {0}")]
    UnknownRun(RunId),
    #[error("run {0} is still in progress")]
    AlreadyRunning(RunId),
    #[error("no checkpoint store configured")]
    NoCheckpointStore,
    #[error("run failed: {0}")]
    Failed(String),
}

/// What `result` reports for a known run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    InProgress,
    Finished(Box<SimulationResult>),
    /// The run could not continue (invalid plan, resume mismatch, store fault).
    Failed(String),
}

struct RunHandle {
    cancel: CancellationToken,
    state: watch::Receiver<RunState>,
}

struct Inner {
    client: Arc<dyn GenerationClient>,
    cache: Arc<CacheStore>,
    checkpoints: Option<Arc<CheckpointStore>>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

/// Cheap to clone; clones share the cache and the run registry.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        cache: Arc<CacheStore>,
        checkpoints: Option<Arc<CheckpointStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                checkpoints,
                runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// In-memory cache, no checkpoints.
    pub fn ephemeral(client: Arc<dyn GenerationClient>) -> Self {
        Self::new(client, Arc::new(CacheStore::in_memory()), None)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.inner.cache
    }

    pub fn checkpoints(&self) -> Option<&Arc<CheckpointStore>> {
        self.inner.checkpoints.as_ref()
    }

    /// Validate `request` and start it in the background. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, request: RunRequest) -> Result<RunId, ExecError> {
        self.start_with_progress(request, ProgressSink::none())
    }

    pub fn start_with_progress(
        &self,
        request: RunRequest,
        progress: ProgressSink,
    ) -> Result<RunId, ExecError> {
        validate_request(&request)?;
        let run_id = RunId::new_random();
        tracing::info!(
            run_id = %run_id,
            entities = request.entities.len(),
            waves = request.waves.len(),
            concurrency = request.config.concurrency_limit,
            model = %request.config.model,
            "starting run"
        );
        let run = RunProgress::new(run_id, request);
        self.spawn(run, WaveNumber::FIRST, None, progress);
        Ok(run_id)
    }

    /// Continue a run from its checkpoint. Outcomes already recorded are kept;
    /// only the remaining work is submitted.
    pub fn resume(&self, run_id: RunId) -> Result<(), ExecError> {
        self.resume_with_progress(run_id, ProgressSink::none())
    }

    pub fn resume_with_progress(
        &self,
        run_id: RunId,
        progress: ProgressSink,
    ) -> Result<(), ExecError> {
        let store = self
            .inner
            .checkpoints
            .as_ref()
            .ok_or(ExecError::NoCheckpointStore)?;
        if matches!(self.state_of(&run_id), Some(RunState::InProgress)) {
            return Err(ExecError::AlreadyRunning(run_id));
        }

        let ck = store.load(&run_id)?;
        validate_request(&ck.request)?;
        let (run, start, memory) = RunProgress::resume_from(ck);
        tracing::info!(
            run_id = %run_id,
            from_wave = %start,
            recorded = run.outcomes.len(),
            committed = run.committed.len(),
            "resuming run"
        );
        self.spawn(run, start, Some(memory), progress);
        Ok(())
    }

    /// Non-blocking peek at a run.
    pub fn result(&self, run_id: RunId) -> Result<RunState, ExecError> {
        self.state_of(&run_id).ok_or(ExecError::UnknownRun(run_id))
    }

    /// Request cancellation. In-flight calls finish and a checkpoint is
    /// written. Returns false for unknown runs.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.registry().get(&run_id) {
            Some(handle) => {
                tracing::info!(run_id = %run_id, "cancellation requested");
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn wait(&self, run_id: RunId) -> Result<SimulationResult, ExecError> {
        let mut rx = self
            .registry()
            .get(&run_id)
            .map(|h| h.state.clone())
            .ok_or(ExecError::UnknownRun(run_id))?;
        loop {
            match &*rx.borrow_and_update() {
                RunState::InProgress => {}
                RunState::Finished(result) => return Ok((**result).clone()),
                RunState::Failed(msg) => return Err(ExecError::Failed(msg.clone())),
            }
            if rx.changed().await.is_err() {
                return Err(ExecError::Failed("run task ended without a result".into()));
            }
        }
    }

    /// `start` then `wait`. The run is dropped from the registry afterwards.
    pub async fn execute(&self, request: RunRequest) -> Result<SimulationResult, ExecError> {
        let run_id = self.start(request)?;
        let result = self.wait(run_id).await;
        self.forget(run_id);
        result
    }

    /// Drop a finished run, and the result it holds, from the registry.
    /// Runs still in progress are kept; returns whether anything was removed.
    pub fn forget(&self, run_id: RunId) -> bool {
        let mut runs = self.registry();
        let finished = runs
            .get(&run_id)
            .is_some_and(|h| !matches!(*h.state.borrow(), RunState::InProgress));
        if finished {
            runs.remove(&run_id);
        }
        finished
    }

    /// Number of runs the registry currently tracks.
    pub fn tracked_runs(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_of(&self, run_id: &RunId) -> Option<RunState> {
        self.registry().get(run_id).map(|h| h.state.borrow().clone())
    }

    fn spawn(
        &self,
        run: RunProgress,
        start: WaveNumber,
        memory: Option<MemorySnapshot>,
        progress: ProgressSink,
    ) {
        let run_id = run.run_id;
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(RunState::InProgress);
        self.registry().insert(
            run_id,
            RunHandle {
                cancel: cancel.clone(),
                state: rx,
            },
        );

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let state = match drive(inner, run, start, memory, cancel, progress).await {
                Ok(result) => {
                    tracing::info!(
                        run_id = %run_id,
                        status = ?result.status,
                        successes = result.success_count(),
                        outcomes = result.outcomes.len(),
                        "run finished"
                    );
                    RunState::Finished(Box::new(result))
                }
                Err(e) => {
                    tracing::error!(run_id = %run_id, error = %e, "run failed");
                    RunState::Failed(e.to_string())
                }
            };
            let _ = tx.send(state);
        });
    }
}

async fn drive(
    inner: Arc<Inner>,
    mut run: RunProgress,
    start: WaveNumber,
    memory: Option<MemorySnapshot>,
    cancel: CancellationToken,
    progress: ProgressSink,
) -> Result<SimulationResult, ExecError> {
    let conversations = Arc::new(ConversationStore::new());
    if let Some(snapshot) = memory {
        conversations.restore(snapshot);
    }
    let executor = TaskExecutor::new(
        Arc::clone(&inner.client),
        Arc::clone(&inner.cache),
        &run.request.config,
    );
    let orchestrator = WaveOrchestrator::new(executor, conversations, inner.checkpoints.clone());
    let status = orchestrator
        .run_waves(&mut run, start, &cancel, &progress)
        .await?;

    if status == RunStatus::Completed {
        if let Some(store) = &inner.checkpoints {
            if let Err(e) = offload::checkpoint_delete(store, run.run_id).await {
                tracing::warn!(run_id = %run.run_id, error = %e, "could not remove checkpoint of completed run");
            }
        }
    }

    Ok(SimulationResult {
        run_id: run.run_id,
        manifest: run.manifest.finish(now_millis()),
        status,
        committed_waves: run.committed,
        outcomes: run.outcomes,
    })
}
