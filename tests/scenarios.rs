//! End-to-end runs through the simulation engine.

mod common;

use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use cohort_core::checkpoint::CheckpointPhase;
use cohort_core::id::{EntityId, RunId, WaveNumber};
use cohort_core::types::{ErrorKind, OutcomeMap, OutcomeStatus, Role, RunStatus};
use cohort_exec::{
    Engine, ExecError, GenerationClient, GenerationError, ProgressSink, RunProgress, RunState,
    TaskExecutor, WaveOrchestrator,
};
use cohort_io::MemoryStorage;
use cohort_store::{CacheStore, CheckpointStore, ConversationStore, Storage};

use common::{answer_for, study, ScriptedClient};

fn checkpoint_store(storage: &MemoryStorage) -> Arc<CheckpointStore> {
    Arc::new(CheckpointStore::new(Arc::new(storage.clone()), "checkpoints"))
}

fn engine(client: &Arc<ScriptedClient>, checkpoints: Arc<CheckpointStore>) -> Engine {
    Engine::new(
        client.clone() as Arc<dyn GenerationClient>,
        Arc::new(CacheStore::in_memory()),
        Some(checkpoints),
    )
}

fn texts(outcomes: &OutcomeMap) -> Vec<(u64, Option<String>)> {
    outcomes
        .values()
        .map(|o| (o.task_id.get(), o.response_text().map(str::to_string)))
        .collect()
}

#[tokio::test]
async fn test_single_wave_all_success() {
    let storage = MemoryStorage::new();
    let checkpoints = checkpoint_store(&storage);
    let client = ScriptedClient::new();
    let engine = engine(&client, Arc::clone(&checkpoints));

    let req = study(3, &[&["Do you own a car?", "How far is work?"]], 2);
    let result = engine.execute(req).await.unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.outcomes.len(), 6);
    assert_eq!(result.success_count(), 6);
    let stats = engine.cache().stats();
    assert_eq!((stats.misses, stats.hits), (6, 0));
    assert!(checkpoints.list().unwrap().is_empty());
    assert_eq!(result.committed_waves, vec![WaveNumber::FIRST]);
}

#[tokio::test]
async fn test_identical_rerun_is_served_from_cache() {
    let storage = MemoryStorage::new();
    let client = ScriptedClient::new();
    let engine = engine(&client, checkpoint_store(&storage));
    let req = study(3, &[&["Do you own a car?", "How far is work?"]], 2);

    let first = engine.execute(req.clone()).await.unwrap();
    assert_eq!(client.calls(), 6);
    let second = engine.execute(req).await.unwrap();

    assert_eq!(client.calls(), 6);
    let stats = engine.cache().stats();
    assert_eq!((stats.misses, stats.hits), (6, 6));
    assert_eq!(texts(&first.outcomes), texts(&second.outcomes));
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_memory_threads_through_three_waves() {
    let client = ScriptedClient::new();
    let req = study(1, &[&["First visit?"], &["Second visit?"], &["Third visit?"]], 1);
    let memory = Arc::new(ConversationStore::new());
    let executor = TaskExecutor::new(
        client.clone() as Arc<dyn GenerationClient>,
        Arc::new(CacheStore::in_memory()),
        &req.config,
    );
    let orchestrator = WaveOrchestrator::new(executor, Arc::clone(&memory), None);
    let mut run = RunProgress::new(RunId::new_random(), req);

    let status = orchestrator
        .run_waves(&mut run, WaveNumber::FIRST, &CancellationToken::new(), &ProgressSink::none())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Completed);

    let turns = memory.read(&EntityId::new("p-0"));
    assert_eq!(turns.len(), 6);
    let shape: Vec<(u64, Role)> = turns.iter().map(|t| (t.wave.get(), t.role)).collect();
    assert_eq!(
        shape,
        vec![
            (1, Role::Requester),
            (1, Role::Responder),
            (2, Role::Requester),
            (2, Role::Responder),
            (3, Role::Requester),
            (3, Role::Responder),
        ]
    );
    assert_eq!(turns[5].content, answer_for("Third visit?"));

    // Each wave's prompt carries every earlier wave and nothing later.
    let prompts = client.prompts();
    assert!(!prompts[0].contains("Earlier"));
    assert!(prompts[1].contains(&answer_for("First visit?")));
    assert!(prompts[2].contains(&answer_for("First visit?")));
    assert!(prompts[2].contains(&answer_for("Second visit?")));
    assert!(!prompts[1].contains("Third visit?"));
}

#[tokio::test]
async fn test_cached_rerun_rebuilds_memory_across_waves() {
    let client = ScriptedClient::new();
    let req = study(1, &[&["First visit?"], &["Second visit?"], &["Third visit?"]], 1);
    let cache = Arc::new(CacheStore::in_memory());

    let mut transcripts = Vec::new();
    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let memory = Arc::new(ConversationStore::new());
        let executor = TaskExecutor::new(
            client.clone() as Arc<dyn GenerationClient>,
            Arc::clone(&cache),
            &req.config,
        );
        let orchestrator = WaveOrchestrator::new(executor, Arc::clone(&memory), None);
        let mut run = RunProgress::new(RunId::new_random(), req.clone());
        let status = orchestrator
            .run_waves(&mut run, WaveNumber::FIRST, &CancellationToken::new(), &ProgressSink::none())
            .await
            .unwrap();
        assert_eq!(status, RunStatus::Completed);
        transcripts.push(memory.read(&EntityId::new("p-0")));
        outcomes.push(run.outcomes.clone());
    }

    // Later wave keys depend on the memory, so a hit in wave 3 means waves 1
    // and 2 were replayed into the fresh store.
    assert_eq!(client.calls(), 3);
    assert_eq!(cache.stats().hits, 3);
    assert!(outcomes[1]
        .values()
        .all(|o| matches!(o.status, OutcomeStatus::Success { cached: true, .. })));
    assert_eq!(texts(&outcomes[0]), texts(&outcomes[1]));

    let rerun = &transcripts[1];
    assert_eq!(rerun.len(), 6);
    let waves: Vec<u64> = rerun.iter().map(|t| t.wave.get()).collect();
    assert_eq!(waves, vec![1, 1, 2, 2, 3, 3]);
    let content = |turns: &[cohort_core::types::ConversationTurn]| {
        turns.iter().map(|t| (t.role, t.content.clone())).collect::<Vec<_>>()
    };
    assert_eq!(content(rerun), content(&transcripts[0]));
}

/// Memory storage that notes which thread touched it.
#[derive(Clone, Default)]
struct ThreadRecordingStorage {
    inner: MemoryStorage,
    threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl ThreadRecordingStorage {
    fn note(&self) {
        self.threads.lock().unwrap().push(thread::current().id());
    }

    fn threads(&self) -> Vec<ThreadId> {
        self.threads.lock().unwrap().clone()
    }
}

impl Storage for ThreadRecordingStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> cohort_store::Result<()> {
        self.note();
        self.inner.write(path, bytes)
    }

    fn read(&self, path: &str) -> cohort_store::Result<Option<Vec<u8>>> {
        self.note();
        self.inner.read(path)
    }

    fn delete(&self, path: &str) -> cohort_store::Result<()> {
        self.note();
        self.inner.delete(path)
    }

    fn list(&self, prefix: &str) -> cohort_store::Result<Vec<String>> {
        self.note();
        self.inner.list(prefix)
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_store_io_stays_off_the_runtime_thread() {
    let storage = ThreadRecordingStorage::default();
    let client = ScriptedClient::new();
    let engine = Engine::new(
        client.clone() as Arc<dyn GenerationClient>,
        Arc::new(CacheStore::with_backend(Arc::new(storage.clone()), "cache")),
        Some(Arc::new(CheckpointStore::new(Arc::new(storage.clone()), "checkpoints"))),
    );
    let req = study(2, &[&["Do you own a car?"], &["Still?"]], 1);

    let result = engine.execute(req).await.unwrap();
    assert_eq!(result.status, RunStatus::Completed);

    let runtime_thread = thread::current().id();
    let seen = storage.threads();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|id| *id != runtime_thread));
}

#[tokio::test]
async fn test_resume_after_fatal_matches_uninterrupted_run() {
    let waves: &[&[&str]] = &[&["Morning routine?"], &["Evening routine?", "Weekend plans?"]];

    let baseline_client = ScriptedClient::new();
    let baseline = Engine::ephemeral(baseline_client.clone() as Arc<dyn GenerationClient>)
        .execute(study(3, waves, 1))
        .await
        .unwrap();
    assert_eq!(baseline.status, RunStatus::Completed);

    let storage = MemoryStorage::new();
    let checkpoints = checkpoint_store(&storage);
    let failing = ScriptedClient::new();
    failing.fail_on("Weekend plans?", vec![GenerationError::fatal("401 unauthorized")]);
    let first = engine(&failing, Arc::clone(&checkpoints))
        .execute(study(3, waves, 1))
        .await
        .unwrap();
    assert!(matches!(first.status, RunStatus::Aborted { wave, .. } if wave == WaveNumber::new(2)));
    assert_eq!(first.committed_waves, vec![WaveNumber::FIRST]);

    let ck = checkpoints.load(&first.run_id).unwrap();
    assert_eq!(ck.phase, CheckpointPhase::Running);
    assert_eq!(ck.wave, WaveNumber::new(2));
    let fatal = ck
        .partial_result
        .outcomes
        .values()
        .filter(|o| o.error_kind() == Some(ErrorKind::Fatal))
        .count();
    assert_eq!(fatal, 1);
    let expected_calls = ck.remaining_task_ids.len() + fatal;

    // A fresh process: new client, empty cache, same checkpoint store.
    let fixed = ScriptedClient::new();
    let resumed_engine = engine(&fixed, Arc::clone(&checkpoints));
    resumed_engine.resume(first.run_id).unwrap();
    let resumed = resumed_engine.wait(first.run_id).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(resumed.run_id, first.run_id);
    assert_eq!(fixed.calls(), expected_calls);
    assert_eq!(texts(&resumed.outcomes), texts(&baseline.outcomes));
    assert_eq!(resumed.committed_waves, baseline.committed_waves);
    assert!(checkpoints.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_then_resume_completes_remaining_work() {
    let storage = MemoryStorage::new();
    let checkpoints = checkpoint_store(&storage);
    let slow = ScriptedClient::with_delay(Duration::from_millis(30));
    let engine = engine(&slow, Arc::clone(&checkpoints));

    let run_id = engine.start(study(10, &[&["Long survey?"]], 1)).unwrap();
    assert_eq!(engine.result(run_id).unwrap(), RunState::InProgress);
    tokio::time::sleep(Duration::from_millis(75)).await;
    assert!(engine.cancel(run_id));
    let partial = engine.wait(run_id).await.unwrap();

    assert_eq!(partial.status, RunStatus::Cancelled { wave: WaveNumber::FIRST });
    assert!(partial.outcomes.len() < 10);
    assert!(partial.committed_waves.is_empty());
    let ck = checkpoints.load(&run_id).unwrap();
    assert_eq!(ck.completed_task_ids.len(), partial.outcomes.len());
    assert_eq!(ck.remaining_task_ids.len(), 10 - partial.outcomes.len());

    let done_before = slow.calls();
    engine.resume(run_id).unwrap();
    let full = engine.wait(run_id).await.unwrap();
    assert_eq!(full.status, RunStatus::Completed);
    assert_eq!(full.outcomes.len(), 10);
    assert_eq!(slow.calls() - done_before, 10 - partial.outcomes.len());
}

#[tokio::test]
async fn test_failed_required_wave_aborts_run() {
    let client = ScriptedClient::new();
    client.fail_on("Refused?", vec![GenerationError::malformed("empty"); 2]);
    let engine = Engine::ephemeral(client.clone() as Arc<dyn GenerationClient>);
    let result = engine
        .execute(study(2, &[&["Refused?"], &["Never reached?"]], 2))
        .await
        .unwrap();

    assert!(matches!(result.status, RunStatus::Aborted { wave, .. } if wave == WaveNumber::FIRST));
    assert!(result.committed_waves.is_empty());
    assert_eq!(result.failures().count(), 2);
    assert!(client.prompts().iter().all(|p| !p.contains("Never reached?")));
}

#[tokio::test]
async fn test_resume_unknown_run_reports_missing_checkpoint() {
    let storage = MemoryStorage::new();
    let engine = engine(&ScriptedClient::new(), checkpoint_store(&storage));
    let err = engine.resume(RunId::new_random()).unwrap_err();
    assert!(matches!(err, ExecError::Store(cohort_store::Error::NotFound(_))));
}
