//! Task executor: runs one wave's tasks under a concurrency bound.
//!
//! Launch loop:
//! - pop the next task; a cache hit is recorded immediately without a permit
//! - otherwise wait for a limiter permit (reaping finished workers meanwhile)
//!   and spawn a worker that calls the generation client through the retry
//!   wrapper; the permit is held until the call returns
//! - every recorded outcome ticks the checkpoint cadence
//!
//! Each task's outcome is independent. A `Fatal` failure stops new launches;
//! in-flight workers are drained and their outcomes kept. Cancellation does the
//! same and always ends with a checkpoint attempt. The executor never raises:
//! it returns whatever outcomes exist plus an incompleteness flag.
//!
//! Cache backend reads and writes go through `offload`, and `CheckpointHook`
//! is async, so no store I/O runs on a runtime worker.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use cohort_core::config::RunConfig;
use cohort_core::id::{TaskId, WaveNumber};
use cohort_core::manifest::now_millis;
use cohort_core::types::{
    CacheEntry, ErrorKind, OutcomeMap, OutcomeStatus, Task, TaskOutcome,
};
use cohort_store::CacheStore;

use crate::client::{GenerationClient, GenerationError, GenerationRequest};
use crate::metrics::ExecMetrics;
use crate::offload;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::retry::{RetryOutcome, RetryingClient};
use crate::throttle::{AdaptiveLimiter, LimiterPermit};

/// Persists mid-wave progress. Implemented by the orchestrator, which knows
/// the rest of the run state that goes into a checkpoint. Implementations must
/// not block the calling task on storage I/O.
#[async_trait]
pub trait CheckpointHook: Send {
    async fn save(
        &mut self,
        wave_outcomes: &OutcomeMap,
        remaining: &BTreeSet<TaskId>,
    ) -> Result<(), cohort_store::Error>;
}

/// Optional collaborators for one `run` call.
#[derive(Default)]
pub struct RunHooks<'a> {
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
    pub checkpoint: Option<&'a mut dyn CheckpointHook>,
}

#[derive(Debug)]
pub struct ExecutionReport {
    /// One entry per task that reached a terminal outcome.
    pub outcomes: OutcomeMap,
    /// Tasks submitted to `run` that have no outcome.
    pub remaining: BTreeSet<TaskId>,
    /// Every task has an outcome.
    pub complete: bool,
    /// The first `Fatal` failure, which stopped further launches.
    pub fatal: Option<(TaskId, GenerationError)>,
}

struct Cadence {
    every: usize,
    interval: Duration,
    since_save: usize,
    last_save: Instant,
}

impl Cadence {
    fn new(every: usize, interval: Duration) -> Self {
        Self {
            every: every.max(1),
            interval,
            since_save: 0,
            last_save: Instant::now(),
        }
    }

    /// Count one completion; true when a save is due.
    fn tick(&mut self) -> bool {
        self.since_save += 1;
        self.since_save >= self.every || self.last_save.elapsed() >= self.interval
    }

    fn saved(&mut self) {
        self.since_save = 0;
        self.last_save = Instant::now();
    }
}

pub struct TaskExecutor {
    client: RetryingClient,
    cache: Arc<CacheStore>,
    model: String,
    adaptive: bool,
    checkpoint_every: usize,
    checkpoint_interval: Duration,
    metrics: Arc<ExecMetrics>,
}

impl TaskExecutor {
    pub fn new(
        client: Arc<dyn GenerationClient>,
        cache: Arc<CacheStore>,
        config: &RunConfig,
    ) -> Self {
        Self {
            client: RetryingClient::new(client, config.retry.clone(), config.request_timeout()),
            cache,
            model: config.model.clone(),
            adaptive: config.adaptive_concurrency,
            checkpoint_every: config.checkpoint_every,
            checkpoint_interval: config.checkpoint_interval(),
            metrics: Arc::new(ExecMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<ExecMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ExecMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Run `tasks` with at most `concurrency_limit` generation calls in flight.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        concurrency_limit: usize,
        hooks: RunHooks<'_>,
    ) -> ExecutionReport {
        let limiter = AdaptiveLimiter::new(concurrency_limit, self.adaptive);
        let mut state = WaveRun {
            wave: tasks.first().map(|t| t.wave),
            all_ids: tasks.iter().map(|t| t.task_id).collect(),
            outcomes: OutcomeMap::new(),
            fatal: None,
            cadence: Cadence::new(self.checkpoint_every, self.checkpoint_interval),
            stop: hooks.cancel.child_token(),
            progress: hooks.progress,
            checkpoint: hooks.checkpoint,
        };

        let mut queue: VecDeque<Task> = tasks.into();
        let mut workers: JoinSet<(TaskId, RetryOutcome)> = JoinSet::new();
        let mut running: HashMap<tokio::task::Id, Task> = HashMap::new();
        let mut waiting: Option<Task> = None;

        loop {
            if state.stop.is_cancelled() {
                break;
            }
            let task = match waiting.take() {
                Some(t) => t,
                None => match queue.pop_front() {
                    None => break,
                    Some(t) => match offload::cache_get(&self.cache, t.cache_key).await {
                        Some(hit) => {
                            self.record_hit(&mut state, t, hit).await;
                            continue;
                        }
                        None => t,
                    },
                },
            };

            tokio::select! {
                biased;
                _ = state.stop.cancelled() => {
                    waiting = Some(task);
                }
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    self.reap(&mut state, &limiter, &mut running, joined).await;
                    waiting = Some(task);
                }
                permit = limiter.acquire() => match permit {
                    Ok(permit) => {
                        self.metrics.observe_in_flight(limiter.in_flight());
                        self.launch(&state, &limiter, &mut workers, &mut running, task, permit);
                    }
                    Err(_) => {
                        tracing::debug!(task = %task.task_id, "limiter closed; task left unlaunched");
                        break;
                    }
                },
            }
        }

        if !workers.is_empty() {
            tracing::debug!(in_flight = workers.len(), "draining in-flight generations");
        }
        while let Some(joined) = workers.join_next_with_id().await {
            self.reap(&mut state, &limiter, &mut running, joined).await;
        }

        let remaining = state.remaining();
        let complete = remaining.is_empty();
        if !complete {
            tracing::info!(
                wave = ?state.wave,
                completed = state.outcomes.len(),
                remaining = remaining.len(),
                "wave stopped before completion"
            );
            state.save(&self.metrics).await;
        }

        ExecutionReport {
            outcomes: state.outcomes,
            remaining,
            complete,
            fatal: state.fatal,
        }
    }

    fn launch(
        &self,
        state: &WaveRun<'_>,
        limiter: &Arc<AdaptiveLimiter>,
        workers: &mut JoinSet<(TaskId, RetryOutcome)>,
        running: &mut HashMap<tokio::task::Id, Task>,
        task: Task,
        permit: LimiterPermit,
    ) {
        self.metrics.record_launch();
        let client = self.client.clone();
        let limiter = Arc::clone(limiter);
        let metrics = Arc::clone(&self.metrics);
        let progress = state.progress.clone();
        let stop = state.stop.clone();
        let task_id = task.task_id;
        let request = GenerationRequest {
            model: self.model.clone(),
            prompt: task.prompt_text.clone(),
            sampling: task.sampling.clone(),
        };

        let handle = workers.spawn(async move {
            let _permit = permit;
            let outcome = client
                .call(&request, &stop, |err, attempt, will_retry| {
                    if err.kind == ErrorKind::RateLimited {
                        metrics.record_rate_limited();
                        if let Some(limit) = limiter.on_rate_limited() {
                            tracing::warn!(task = %task_id, attempt, limit, "rate limited; reducing concurrency");
                            progress.emit(ProgressEvent::ConcurrencyChanged { limit });
                        }
                    }
                    if will_retry {
                        metrics.record_retry();
                    }
                })
                .await;
            (task_id, outcome)
        });
        running.insert(handle.id(), task);
    }

    async fn reap(
        &self,
        state: &mut WaveRun<'_>,
        limiter: &AdaptiveLimiter,
        running: &mut HashMap<tokio::task::Id, Task>,
        joined: Result<(tokio::task::Id, (TaskId, RetryOutcome)), JoinError>,
    ) {
        let (id, result) = match joined {
            Ok((id, (_, outcome))) => (id, Ok(outcome)),
            Err(e) => (e.id(), Err(e)),
        };
        let Some(task) = running.remove(&id) else {
            tracing::error!(task_handle = %id, "finished worker has no task");
            return;
        };

        let retry = match result {
            Ok(retry) => retry,
            Err(join_err) => {
                self.metrics.record_failure();
                tracing::error!(task = %task.task_id, error = %join_err, "generation worker panicked");
                let reason = format!("worker panicked: {join_err}");
                state.record(self, outcome_for(&task, OutcomeStatus::Failed {
                    kind: ErrorKind::Internal,
                    reason,
                    attempts: 0,
                }))
                .await;
                return;
            }
        };

        if retry.cancelled {
            tracing::debug!(task = %task.task_id, attempts = retry.attempts, "task cancelled during backoff");
            return;
        }

        let status = match retry.result {
            Ok(generation) => {
                let entry = CacheEntry {
                    key: task.cache_key,
                    response_text: generation.text.clone(),
                    created_at_ms: now_millis(),
                    token_count: generation.token_count,
                };
                offload::cache_put(&self.cache, entry).await;
                if let Some(limit) = limiter.on_success() {
                    tracing::info!(limit, "concurrency restored");
                    state.progress.emit(ProgressEvent::ConcurrencyChanged { limit });
                }
                OutcomeStatus::Success {
                    response_text: generation.text,
                    cached: false,
                    attempts: retry.attempts,
                    token_count: generation.token_count,
                }
            }
            Err(err) => {
                self.metrics.record_failure();
                if err.kind == ErrorKind::Fatal {
                    tracing::error!(task = %task.task_id, error = %err.message, "fatal generation error; stopping launches");
                    state.stop.cancel();
                    if state.fatal.is_none() {
                        state.fatal = Some((task.task_id, err.clone()));
                    }
                } else {
                    tracing::debug!(task = %task.task_id, kind = %err.kind, attempts = retry.attempts, error = %err.message, "task failed");
                }
                OutcomeStatus::Failed {
                    kind: err.kind,
                    reason: err.message,
                    attempts: retry.attempts,
                }
            }
        };
        state.record(self, outcome_for(&task, status)).await;
    }

    async fn record_hit(&self, state: &mut WaveRun<'_>, task: Task, hit: CacheEntry) {
        self.metrics.record_cache_hit();
        state.record(
            self,
            outcome_for(
                &task,
                OutcomeStatus::Success {
                    response_text: hit.response_text,
                    cached: true,
                    attempts: 0,
                    token_count: hit.token_count,
                },
            ),
        )
        .await;
    }
}

fn outcome_for(task: &Task, status: OutcomeStatus) -> TaskOutcome {
    TaskOutcome {
        task_id: task.task_id,
        entity_id: task.entity_id.clone(),
        wave: task.wave,
        prompt_id: task.prompt_id.clone(),
        status,
    }
}

/// Mutable state of one `run` call.
struct WaveRun<'h> {
    wave: Option<WaveNumber>,
    all_ids: BTreeSet<TaskId>,
    outcomes: OutcomeMap,
    fatal: Option<(TaskId, GenerationError)>,
    cadence: Cadence,
    stop: CancellationToken,
    progress: ProgressSink,
    checkpoint: Option<&'h mut dyn CheckpointHook>,
}

impl WaveRun<'_> {
    fn remaining(&self) -> BTreeSet<TaskId> {
        self.all_ids
            .iter()
            .filter(|id| !self.outcomes.contains_key(id))
            .copied()
            .collect()
    }

    async fn record(&mut self, exec: &TaskExecutor, outcome: TaskOutcome) {
        let (success, cached) = match &outcome.status {
            OutcomeStatus::Success { cached, .. } => (true, *cached),
            OutcomeStatus::Failed { .. } => (false, false),
        };
        tracing::debug!(
            task = %outcome.task_id,
            entity = %outcome.entity_id,
            wave = %outcome.wave,
            success,
            cached,
            "task completed"
        );
        self.progress.emit(ProgressEvent::TaskCompleted {
            task_id: outcome.task_id,
            entity_id: outcome.entity_id.clone(),
            wave: outcome.wave,
            success,
            cached,
        });
        self.outcomes.insert(outcome.task_id, outcome);

        if self.cadence.tick() {
            self.save(&exec.metrics).await;
        }
    }

    /// Persist progress through the hook. A failure is logged and retried on
    /// the next cadence tick.
    async fn save(&mut self, metrics: &ExecMetrics) {
        let Some(hook) = self.checkpoint.as_mut() else {
            self.cadence.saved();
            return;
        };
        let remaining = self
            .all_ids
            .iter()
            .filter(|id| !self.outcomes.contains_key(id))
            .copied()
            .collect::<BTreeSet<_>>();
        let wave = self.wave.unwrap_or(WaveNumber::FIRST);
        match hook.save(&self.outcomes, &remaining).await {
            Ok(()) => {
                self.cadence.saved();
                metrics.record_checkpoint();
                self.progress.emit(ProgressEvent::CheckpointSaved {
                    wave,
                    completed: self.outcomes.len(),
                    remaining: remaining.len(),
                });
            }
            Err(e) => {
                tracing::warn!(wave = %wave, error = %e, "checkpoint save failed; will retry");
                self.progress.emit(ProgressEvent::CheckpointFailed {
                    wave,
                    error: e.to_string(),
                });
            }
        }
    }
}
