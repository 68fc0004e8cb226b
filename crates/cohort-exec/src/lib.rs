#![forbid(unsafe_code)]
//! cohort-exec: bounded-concurrency execution of generation tasks.
//!
//! Layering, leaf first:
//! - `client`: the generation boundary (`GenerationClient`) and its error taxonomy.
//! - `retry`: applies a `RetryPolicy` and the per-call timeout around a client.
//! - `throttle`: semaphore-backed limiter that shrinks on rate limiting.
//! - `executor`: runs one wave's tasks under the limiter, consulting the cache,
//!   recording every outcome, and driving checkpoint cadence.
//! - `orchestrator`: sequences waves, commits conversation memory, aborts on
//!   failed required waves.
//! - `runtime`: the `Engine` (start/resume/result/cancel/wait over a run registry).

pub mod client;
pub mod executor;
pub mod metrics;
mod offload;
pub mod orchestrator;
pub mod progress;
pub mod replay;
pub mod retry;
pub mod runtime;
pub mod throttle;

pub use client::{Generation, GenerationClient, GenerationError, GenerationRequest};
pub use executor::{CheckpointHook, ExecutionReport, RunHooks, TaskExecutor};
pub use metrics::{ExecMetrics, MetricsSnapshot};
pub use orchestrator::{RunProgress, WaveOrchestrator, WaveState};
pub use progress::{ProgressEvent, ProgressSink};
pub use retry::{RetryOutcome, RetryingClient};
pub use runtime::{Engine, ExecError, RunState};
pub use throttle::AdaptiveLimiter;
