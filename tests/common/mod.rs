//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use cohort_core::config::{RetryPolicy, RunConfig};
use cohort_core::types::{EntitySnapshot, PromptSpec, RunRequest, SamplingParams, WaveDefinition};
use cohort_exec::{Generation, GenerationClient, GenerationError, GenerationRequest};

/// Generation client with scripted failures and call accounting.
///
/// Answers `answer to: <last prompt line>`. Failures are keyed by a substring
/// of the prompt's last line (the question): queued errors are returned first,
/// then the call succeeds.
#[derive(Default)]
pub struct ScriptedClient {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    script: Mutex<HashMap<String, VecDeque<GenerationError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Queue `errors` for questions containing `needle`.
    pub fn fail_on(&self, needle: &str, errors: Vec<GenerationError>) {
        self.script
            .lock()
            .unwrap()
            .entry(needle.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn scripted_error(&self, question: &str) -> Option<GenerationError> {
        let mut script = self.script.lock().unwrap();
        script
            .iter_mut()
            .find(|(needle, queue)| question.contains(needle.as_str()) && !queue.is_empty())
            .and_then(|(_, queue)| queue.pop_front())
    }
}

pub fn answer_for(question: &str) -> String {
    format!("answer to: {question}")
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
        _timeout: Duration,
    ) -> Result<Generation, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let question = request.prompt.lines().last().unwrap_or_default();
        match self.scripted_error(question) {
            Some(err) => Err(err),
            None => Ok(Generation::new(answer_for(question))),
        }
    }
}

/// Config with millisecond backoff so retry tests stay fast.
pub fn fast_config(concurrency_limit: usize) -> RunConfig {
    RunConfig {
        concurrency_limit,
        checkpoint_every: 2,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryPolicy::default()
        },
        ..RunConfig::default()
    }
}

/// `entities` entities; `waves[i]` lists the questions of wave `i + 1`.
pub fn study(entities: usize, waves: &[&[&str]], concurrency_limit: usize) -> RunRequest {
    RunRequest {
        entities: (0..entities)
            .map(|i| EntitySnapshot::new(format!("p-{i}"), json!({ "index": i, "region": "north" })))
            .collect(),
        waves: waves
            .iter()
            .enumerate()
            .map(|(i, questions)| {
                WaveDefinition::new(
                    i as u64 + 1,
                    questions
                        .iter()
                        .enumerate()
                        .map(|(j, q)| PromptSpec::new(format!("w{}q{}", i + 1, j + 1), *q))
                        .collect(),
                )
            })
            .collect(),
        sampling: SamplingParams::default(),
        config: fast_config(concurrency_limit),
    }
}
