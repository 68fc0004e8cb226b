//! cohort CLI: run, resume, and inspect simulation studies.

mod clients;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use cohort_core::config::{RunConfig, StoreConfig};
use cohort_core::id::{RunId, WaveNumber};
use cohort_core::types::{RunRequest, RunStatus, SimulationResult};
use cohort_exec::{Engine, GenerationClient, ProgressEvent, ProgressSink};
use cohort_io::{build_storage_from_uri, JsonlWriter};
use cohort_planner::{estimate_work, parse_yaml_study, plan_wave, validate_request, StudyConfig};
use cohort_store::{CacheStore, CheckpointStore, Codec};

use crate::clients::{EchoClient, OllamaClient};

/// Where the cache and checkpoints go when neither the environment, the study
/// nor a flag names a location. Each store keeps its own prefix below it.
const DEFAULT_STATE_DIR: &str = ".cohort";
const CACHE_PREFIX: &str = "cache";
const CHECKPOINT_PREFIX: &str = "checkpoints";
const EXPLAIN_TASK_LINES: usize = 20;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Bounded-concurrency LLM simulations with caching and checkpoint/resume", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a study from a YAML file
    Run {
        /// Path to the study YAML file
        #[arg(short, long)]
        study: PathBuf,

        #[command(flatten)]
        overrides: ConfigOverrides,

        #[command(flatten)]
        stores: StoreArgs,

        #[command(flatten)]
        client: ClientArgs,

        /// Write one JSON line per task outcome
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Continue an interrupted run from its checkpoint
    Resume {
        #[arg(long)]
        run_id: String,

        /// Study file whose `config:` store settings locate the run
        #[arg(short, long)]
        study: Option<PathBuf>,

        #[command(flatten)]
        stores: StoreArgs,

        #[command(flatten)]
        client: ClientArgs,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a study YAML file
    Validate {
        #[arg(short, long)]
        study: PathBuf,
    },

    /// Show the expanded task plan for a study
    Explain {
        #[arg(short, long)]
        study: PathBuf,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },

    /// Summarize stored checkpoints
    Status {
        /// Show one run; lists every checkpointed run when omitted
        #[arg(long)]
        run_id: Option<String>,

        /// Study file whose `config:` store settings locate the checkpoints
        #[arg(short, long)]
        study: Option<PathBuf>,

        #[command(flatten)]
        stores: StoreArgs,
    },
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigOverrides {
    /// Model name (overrides env and study config)
    #[arg(long)]
    model: Option<String>,

    /// Maximum in-flight generation calls
    #[arg(long)]
    concurrency: Option<usize>,

    /// Completions between checkpoints
    #[arg(long)]
    checkpoint_every: Option<usize>,

    /// Per-call timeout in milliseconds
    #[arg(long)]
    request_timeout_ms: Option<u64>,

    /// Keep a fixed concurrency even when rate limited
    #[arg(long)]
    no_adaptive: bool,
}

impl ConfigOverrides {
    fn apply(&self, cfg: &mut RunConfig) {
        if let Some(model) = &self.model {
            cfg.model = model.clone();
        }
        if let Some(n) = self.concurrency {
            cfg.concurrency_limit = n;
        }
        if let Some(n) = self.checkpoint_every {
            cfg.checkpoint_every = n;
        }
        if let Some(ms) = self.request_timeout_ms {
            cfg.request_timeout_ms = ms;
        }
        if self.no_adaptive {
            cfg.adaptive_concurrency = false;
        }
    }
}

#[derive(Args, Debug, Default, Clone)]
struct StoreArgs {
    /// Response cache location (`file:///dir`, a path, or `memory://`)
    #[arg(long)]
    cache_uri: Option<String>,

    /// Checkpoint location
    #[arg(long)]
    checkpoint_uri: Option<String>,

    /// Record compression for both stores (`none`, `zstd`, `lz4`)
    #[arg(long)]
    codec: Option<String>,
}

impl StoreArgs {
    fn apply(&self, stores: &mut StoreConfig) {
        stores.merge(&StoreConfig {
            cache_uri: self.cache_uri.clone(),
            checkpoint_uri: self.checkpoint_uri.clone(),
            codec: self.codec.clone(),
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ClientKind {
    /// Ollama-compatible HTTP endpoint
    Http,
    /// Deterministic offline responses
    Echo,
}

#[derive(Args, Debug, Clone)]
struct ClientArgs {
    #[arg(long, value_enum, default_value_t = ClientKind::Http)]
    client: ClientKind,

    /// Base URL of the generation endpoint
    #[arg(long, default_value = "http://localhost:11434")]
    endpoint: String,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run {
            study,
            overrides,
            stores,
            client,
            out,
        } => run_study(&study, &overrides, &stores, &client, out.as_deref()).await,
        Commands::Resume {
            run_id,
            study,
            stores,
            client,
            out,
        } => resume_run(&run_id, study.as_deref(), &stores, &client, out.as_deref()).await,
        Commands::Validate { study } => validate_study(&study).map(|()| println!("✓ Study is valid")),
        Commands::Explain { study, overrides } => explain_study(&study, &overrides),
        Commands::Status {
            run_id,
            study,
            stores,
        } => show_status(run_id.as_deref(), study.as_deref(), &stores),
    };

    if let Err(e) = outcome {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("COHORT_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Study file + env + flags → request and store locations.
fn load_study(
    path: &Path,
    overrides: &ConfigOverrides,
    store_args: &StoreArgs,
) -> CliResult<(RunRequest, StoreConfig)> {
    let yaml = fs::read_to_string(path)?;
    let parsed = parse_yaml_study(&yaml)?;
    let config = resolve_config(RunConfig::from_env(), &parsed.config, overrides);
    let stores = resolve_stores(StoreConfig::from_env(), Some(&parsed.config), store_args);
    let request = parsed.into_request(config);
    validate_request(&request)?;
    Ok((request, stores))
}

fn resolve_config(base: RunConfig, study: &StudyConfig, overrides: &ConfigOverrides) -> RunConfig {
    let mut config = base;
    study.apply_to(&mut config);
    overrides.apply(&mut config);
    config
}

/// Env, then the study's `config:` block, then flags.
fn resolve_stores(
    base: StoreConfig,
    study: Option<&StudyConfig>,
    store_args: &StoreArgs,
) -> StoreConfig {
    let mut stores = base;
    if let Some(study) = study {
        study.apply_store(&mut stores);
    }
    store_args.apply(&mut stores);
    stores
}

/// Store settings for commands that act on an existing run.
fn stores_for_run(study: Option<&Path>, store_args: &StoreArgs) -> CliResult<StoreConfig> {
    let study = match study {
        Some(path) => Some(parse_yaml_study(&fs::read_to_string(path)?)?.config),
        None => None,
    };
    Ok(resolve_stores(StoreConfig::from_env(), study.as_ref(), store_args))
}

fn store_codec(stores: &StoreConfig) -> CliResult<Codec> {
    let codec = Codec::parse(stores.codec.as_deref().unwrap_or("none"))?;
    if !codec.is_available() {
        return Err(format!(
            "codec {} is not compiled in; rebuild with `--features {}`",
            codec.name(),
            codec.name()
        )
        .into());
    }
    Ok(codec)
}

fn build_engine(client: &ClientArgs, stores: &StoreConfig) -> CliResult<Engine> {
    let client: Arc<dyn GenerationClient> = match client.client {
        ClientKind::Echo => Arc::new(EchoClient),
        ClientKind::Http => Arc::new(OllamaClient::new(client.endpoint.clone())?),
    };
    let codec = store_codec(stores)?;
    let uri = stores.cache_uri.as_deref().unwrap_or(DEFAULT_STATE_DIR);
    let cache = CacheStore::with_backend_codec(build_storage_from_uri(uri)?, CACHE_PREFIX, codec);
    Ok(Engine::new(client, Arc::new(cache), Some(checkpoint_store(stores)?)))
}

fn checkpoint_store(stores: &StoreConfig) -> CliResult<Arc<CheckpointStore>> {
    let uri = stores.checkpoint_uri.as_deref().unwrap_or(DEFAULT_STATE_DIR);
    let storage = build_storage_from_uri(uri)?;
    let codec = store_codec(stores)?;
    Ok(Arc::new(CheckpointStore::with_codec(storage, CHECKPOINT_PREFIX, codec)))
}

async fn run_study(
    path: &Path,
    overrides: &ConfigOverrides,
    store_args: &StoreArgs,
    client: &ClientArgs,
    out: Option<&Path>,
) -> CliResult<()> {
    let (request, stores) = load_study(path, overrides, store_args)?;
    let engine = build_engine(client, &stores)?;
    let (progress, events) = ProgressSink::channel();
    let run_id = engine.start_with_progress(request, progress)?;
    eprintln!("Run {run_id} started");
    let result = supervise(&engine, run_id, events).await?;
    report(&engine, &result, out)
}

async fn resume_run(
    run_id: &str,
    study: Option<&Path>,
    store_args: &StoreArgs,
    client: &ClientArgs,
    out: Option<&Path>,
) -> CliResult<()> {
    let run_id = RunId::parse(run_id)?;
    let stores = stores_for_run(study, store_args)?;
    let engine = build_engine(client, &stores)?;
    let (progress, events) = ProgressSink::channel();
    engine.resume_with_progress(run_id, progress)?;
    eprintln!("Run {run_id} resumed");
    let result = supervise(&engine, run_id, events).await?;
    report(&engine, &result, out)
}

/// Wait for the run, logging progress; the first Ctrl-C requests a
/// cooperative stop.
async fn supervise(
    engine: &Engine,
    run_id: RunId,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
) -> CliResult<SimulationResult> {
    let logger = tokio::spawn(log_progress(events));
    let waiter = engine.wait(run_id);
    tokio::pin!(waiter);
    let mut interrupted = false;
    let result = loop {
        tokio::select! {
            res = &mut waiter => break res,
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                tracing::warn!(run_id = %run_id, "interrupt received; finishing in-flight calls");
                engine.cancel(run_id);
            }
        }
    };
    logger.abort();
    Ok(result?)
}

async fn log_progress(mut events: mpsc::UnboundedReceiver<ProgressEvent>) {
    let mut done = 0usize;
    let mut total = 0usize;
    while let Some(event) = events.recv().await {
        match event {
            ProgressEvent::WaveStarted {
                wave,
                tasks,
                already_done,
            } => {
                done = already_done;
                total = tasks;
                tracing::info!(wave = %wave, tasks, already_done, "wave started");
            }
            ProgressEvent::TaskCompleted { task_id, success, .. } => {
                done += 1;
                tracing::debug!(task = %task_id, success, done, total, "progress");
            }
            ProgressEvent::CheckpointSaved {
                wave,
                completed,
                remaining,
            } => tracing::debug!(wave = %wave, completed, remaining, "checkpoint saved"),
            ProgressEvent::CheckpointFailed { wave, error } => {
                tracing::warn!(wave = %wave, error = %error, "checkpoint failed")
            }
            ProgressEvent::ConcurrencyChanged { limit } => {
                tracing::info!(limit, "effective concurrency changed")
            }
            ProgressEvent::WaveCommitted { wave } => {
                tracing::info!(wave = %wave, done, total, "wave committed")
            }
        }
    }
}

fn report(engine: &Engine, result: &SimulationResult, out: Option<&Path>) -> CliResult<()> {
    if let Some(path) = out {
        let mut writer = JsonlWriter::to_path(path)?;
        writer.write_all(result.outcomes.values())?;
        writer.flush()?;
        println!("  Outcomes written to {}", path.display());
    }

    let stats = engine.cache().stats();
    let failed = result.failures().count();
    match &result.status {
        RunStatus::Completed => println!("✓ Run {} completed", result.run_id),
        RunStatus::Cancelled { wave } => println!(
            "Run {} cancelled during {wave}; continue with `cohort resume --run-id {}`",
            result.run_id, result.run_id
        ),
        RunStatus::Aborted { wave, reason } => {
            println!("✗ Run {} aborted during {wave}: {reason}", result.run_id)
        }
    }
    println!(
        "  Outcomes: {} ({} succeeded, {} failed)",
        result.outcomes.len(),
        result.success_count(),
        failed
    );
    println!(
        "  Committed waves: {}",
        join_waves(&result.committed_waves)
    );
    println!(
        "  Cache: {} hits, {} misses ({:.0}% hit rate)",
        stats.hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );
    println!(
        "  Duration: {}ms",
        result.manifest.finished_ms.saturating_sub(result.manifest.started_ms)
    );

    match &result.status {
        RunStatus::Aborted { wave, .. } => Err(format!("run aborted during {wave}").into()),
        _ => Ok(()),
    }
}

fn join_waves(waves: &[WaveNumber]) -> String {
    if waves.is_empty() {
        return "none".to_string();
    }
    waves
        .iter()
        .map(|w| w.get().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn validate_study(path: &Path) -> CliResult<()> {
    let yaml = fs::read_to_string(path)?;
    let parsed = parse_yaml_study(&yaml)?;
    let config = resolve_config(RunConfig::default(), &parsed.config, &ConfigOverrides::default());
    validate_request(&parsed.into_request(config))?;
    Ok(())
}

fn explain_study(path: &Path, overrides: &ConfigOverrides) -> CliResult<()> {
    let (request, _) = load_study(path, overrides, &StoreArgs::default())?;
    let work = estimate_work(&request);

    println!("Study Execution Plan");
    println!("====================");
    println!();
    println!("Model: {}", request.config.model);
    println!("Concurrency limit: {}", request.config.concurrency_limit);
    println!("Entities: {}", work.entities);
    println!("Total tasks: {}", work.total_tasks);
    println!(
        "Max generation calls (with retries): {}",
        work.max_generation_calls
    );
    println!();
    for w in &work.waves {
        println!(
            "{}: {} prompt(s), {} task(s), {} launch round(s){}",
            w.wave,
            w.prompts,
            w.tasks,
            w.rounds,
            if w.require_full_success { ", requires full success" } else { "" }
        );
    }

    // Later waves depend on responses, so only the first wave can be listed.
    let first = plan_wave(&request, WaveNumber::FIRST, |_| Vec::new())?;
    println!();
    println!("{} tasks:", WaveNumber::FIRST);
    for task in first.iter().take(EXPLAIN_TASK_LINES) {
        println!(
            "  {}. entity {} prompt {} key {}",
            task.task_id.get(),
            task.entity_id,
            task.prompt_id,
            &task.cache_key.to_hex()[..12]
        );
    }
    if first.len() > EXPLAIN_TASK_LINES {
        println!("  ... {} more", first.len() - EXPLAIN_TASK_LINES);
    }
    Ok(())
}

fn show_status(run_id: Option<&str>, study: Option<&Path>, store_args: &StoreArgs) -> CliResult<()> {
    let stores = stores_for_run(study, store_args)?;
    let store = checkpoint_store(&stores)?;

    let Some(run_id) = run_id else {
        let runs = store.list()?;
        if runs.is_empty() {
            println!("No checkpointed runs");
        }
        for id in runs {
            println!("{id}");
        }
        return Ok(());
    };

    let ck = store.load(&RunId::parse(run_id)?)?;
    let failed = ck
        .partial_result
        .outcomes
        .values()
        .filter(|o| !o.is_success())
        .count();
    println!("Run {}", ck.run_id);
    println!("  Wave: {} ({:?})", ck.wave, ck.phase);
    println!(
        "  Wave tasks: {} completed, {} remaining",
        ck.completed_task_ids.len(),
        ck.remaining_task_ids.len()
    );
    println!(
        "  Recorded outcomes: {} ({} failed)",
        ck.partial_result.outcomes.len(),
        failed
    );
    println!("  Committed waves: {}", join_waves(&ck.committed_waves));
    println!("  Entities with memory: {}", ck.memory.len());
    println!("  Saved at: {} ms since epoch", ck.saved_at_ms);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn study_config_overrides_env_defaults() {
        let study = StudyConfig {
            model: Some("mistral".into()),
            concurrency_limit: Some(8),
            ..Default::default()
        };
        let cfg = resolve_config(RunConfig::default(), &study, &ConfigOverrides::default());
        assert_eq!(cfg.model, "mistral");
        assert_eq!(cfg.concurrency_limit, 8);
    }

    #[test]
    fn flags_take_priority_over_study_config() {
        let study = StudyConfig {
            concurrency_limit: Some(8),
            ..Default::default()
        };
        let overrides = ConfigOverrides {
            concurrency: Some(2),
            no_adaptive: true,
            ..Default::default()
        };
        let cfg = resolve_config(RunConfig::default(), &study, &overrides);
        assert_eq!(cfg.concurrency_limit, 2);
        assert!(!cfg.adaptive_concurrency);
    }

    #[test]
    fn store_flags_replace_env_locations() {
        let mut stores = StoreConfig {
            cache_uri: Some("file:///env/cache".into()),
            ..Default::default()
        };
        StoreArgs {
            checkpoint_uri: Some("memory://".into()),
            codec: Some("none".into()),
            ..Default::default()
        }
        .apply(&mut stores);
        assert_eq!(stores.cache_uri.as_deref(), Some("file:///env/cache"));
        assert_eq!(stores.checkpoint_uri.as_deref(), Some("memory://"));
        assert_eq!(stores.codec.as_deref(), Some("none"));
    }

    const SMALL_STUDY: &str = r#"
entities:
  - id: p-1
    attributes: { age: 34 }
  - id: p-2
    attributes: { age: 61 }
waves:
  - prompts:
      - { id: q1, text: "How do you commute?" }
  - prompts:
      - { id: q2, text: "Has that changed?" }
"#;

    fn echo() -> ClientArgs {
        ClientArgs {
            client: ClientKind::Echo,
            endpoint: String::new(),
        }
    }

    #[test]
    fn resume_reads_store_locations_from_the_study() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.yaml");
        fs::write(
            &path,
            format!(
                "config:\n  cache_uri: file:///srv/cache\n  checkpoint_uri: file:///srv/ck\n{SMALL_STUDY}"
            ),
        )
        .unwrap();

        let from_study = resolve_stores(
            StoreConfig::default(),
            Some(&parse_yaml_study(&fs::read_to_string(&path).unwrap()).unwrap().config),
            &StoreArgs::default(),
        );
        assert_eq!(from_study.cache_uri.as_deref(), Some("file:///srv/cache"));
        assert_eq!(from_study.checkpoint_uri.as_deref(), Some("file:///srv/ck"));

        let flagged = StoreArgs {
            checkpoint_uri: Some("memory://".into()),
            ..Default::default()
        };
        let stores = stores_for_run(Some(&path), &flagged).unwrap();
        assert_eq!(stores.checkpoint_uri.as_deref(), Some("memory://"));
    }

    #[test]
    fn unknown_or_missing_codecs_are_rejected_up_front() {
        let stores = StoreConfig {
            codec: Some("brotli".into()),
            ..Default::default()
        };
        assert!(store_codec(&stores).is_err());
        assert_eq!(store_codec(&StoreConfig::default()).unwrap(), Codec::None);
        let zstd = StoreConfig {
            codec: Some("zstd".into()),
            ..Default::default()
        };
        assert_eq!(store_codec(&zstd).is_ok(), cfg!(feature = "zstd"));
    }

    #[tokio::test]
    async fn cache_persists_between_invocations() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_str().unwrap().to_string();
        let stores = StoreConfig {
            cache_uri: Some(root.clone()),
            checkpoint_uri: Some(root),
            ..Default::default()
        };
        let parsed = parse_yaml_study(SMALL_STUDY).unwrap();
        let config = resolve_config(RunConfig::default(), &parsed.config, &ConfigOverrides::default());
        let request = parsed.into_request(config);

        let first = build_engine(&echo(), &stores).unwrap();
        let result = first.execute(request.clone()).await.unwrap();
        assert_eq!(result.success_count(), 4);
        assert_eq!(first.cache().stats().misses, 4);

        let second = build_engine(&echo(), &stores).unwrap();
        let again = second.execute(request).await.unwrap();
        let stats = second.cache().stats();
        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 0);
        let texts = |r: &SimulationResult| {
            r.outcomes
                .values()
                .map(|o| o.response_text().map(str::to_string))
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(&again), texts(&result));
    }

    #[test]
    fn validate_and_explain_accept_a_study_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("study.yaml");
        fs::write(
            &path,
            r#"
entities:
  - id: p-1
    attributes: { age: 34 }
prompts:
  - id: q1
    text: "How do you commute?"
"#,
        )
        .unwrap();
        validate_study(&path).unwrap();
        explain_study(&path, &ConfigOverrides::default()).unwrap();
    }

    #[test]
    fn wave_list_formatting() {
        assert_eq!(join_waves(&[]), "none");
        assert_eq!(join_waves(&[WaveNumber::new(1), WaveNumber::new(2)]), "1, 2");
    }
}
