//! Run configuration that downstream crates can serialize/deserialize.
//!
//! A `RunConfig` is always passed explicitly into the engine; nothing in the
//! library reads process-wide settings. `from_env` exists for the CLI layer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::ErrorKind;

/// Backoff policy applied by the generation-client wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    /// Error kinds that are retried; anything else is terminal on first sight.
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
            retryable: vec![ErrorKind::Transient, ErrorKind::RateLimited],
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable.contains(&kind)
    }

    /// Longest wait between two attempts, whoever asked for it.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Model name passed to the generation endpoint and hashed into cache keys.
    pub model: String,

    /// Maximum number of simultaneously in-flight generation calls.
    pub concurrency_limit: usize,

    /// Per-call timeout; an elapsed timeout counts as a transient failure.
    pub request_timeout_ms: u64,

    /// Persist a checkpoint after this many completions...
    pub checkpoint_every: usize,

    /// ...or when this much time has passed since the last save.
    pub checkpoint_interval_ms: u64,

    pub retry: RetryPolicy,

    /// Shrink effective concurrency on rate limiting, grow it back on success.
    pub adaptive_concurrency: bool,

    /// How many prior turns are rendered into a prompt (`None` = all).
    pub history_turns: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model: "llama3".to_string(),
            concurrency_limit: 4,
            request_timeout_ms: 60_000,
            checkpoint_every: 10,
            checkpoint_interval_ms: 30_000,
            retry: RetryPolicy::default(),
            adaptive_concurrency: true,
            history_turns: None,
        }
    }
}

impl RunConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `COHORT_MODEL`: model name
    /// - `COHORT_CONCURRENCY`: concurrency limit
    /// - `COHORT_REQUEST_TIMEOUT_MS`: per-call timeout
    /// - `COHORT_CHECKPOINT_EVERY`: completions between checkpoints
    /// - `COHORT_CHECKPOINT_INTERVAL_MS`: max time between checkpoints
    /// - `COHORT_RETRY_MAX_ATTEMPTS`, `COHORT_RETRY_BASE_MS`, `COHORT_RETRY_MAX_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`RunConfig::from_env`] with an injectable lookup (tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(s) = lookup("COHORT_MODEL") {
            if !s.trim().is_empty() {
                cfg.model = s;
            }
        }

        if let Some(v) = lookup("COHORT_CONCURRENCY").and_then(|s| s.parse::<usize>().ok()) {
            cfg.concurrency_limit = v;
        }

        if let Some(v) = lookup("COHORT_REQUEST_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.request_timeout_ms = v;
        }

        if let Some(v) = lookup("COHORT_CHECKPOINT_EVERY").and_then(|s| s.parse::<usize>().ok()) {
            cfg.checkpoint_every = v;
        }

        if let Some(v) =
            lookup("COHORT_CHECKPOINT_INTERVAL_MS").and_then(|s| s.parse::<u64>().ok())
        {
            cfg.checkpoint_interval_ms = v;
        }

        if let Some(v) = lookup("COHORT_RETRY_MAX_ATTEMPTS").and_then(|s| s.parse::<u32>().ok()) {
            cfg.retry.max_attempts = v;
        }

        if let Some(v) = lookup("COHORT_RETRY_BASE_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.retry.base_delay_ms = v;
        }

        if let Some(v) = lookup("COHORT_RETRY_MAX_MS").and_then(|s| s.parse::<u64>().ok()) {
            cfg.retry.max_delay_ms = v;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(Error::Config("model name must not be empty".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(Error::Config("concurrency_limit must be at least 1".into()));
        }
        if self.checkpoint_every == 0 {
            return Err(Error::Config("checkpoint_every must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Where the cache and checkpoint stores live, and how their records are
/// compressed. Unset fields fall back to the caller's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `file:///path`, a bare path, or `memory://`.
    pub cache_uri: Option<String>,
    pub checkpoint_uri: Option<String>,
    /// Compression for newly written records (`none`, `zstd`, `lz4`).
    /// Records are self-describing, so reads accept any codec.
    pub codec: Option<String>,
}

impl StoreConfig {
    /// `COHORT_CACHE_URI`, `COHORT_CHECKPOINT_URI`, `COHORT_STORE_CODEC`.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            cache_uri: lookup("COHORT_CACHE_URI"),
            checkpoint_uri: lookup("COHORT_CHECKPOINT_URI"),
            codec: lookup("COHORT_STORE_CODEC"),
        }
    }

    /// Fields set in `other` replace ours.
    pub fn merge(&mut self, other: &StoreConfig) {
        if other.cache_uri.is_some() {
            self.cache_uri = other.cache_uri.clone();
        }
        if other.checkpoint_uri.is_some() {
            self.checkpoint_uri = other.checkpoint_uri.clone();
        }
        if other.codec.is_some() {
            self.codec = other.codec.clone();
        }
    }
}

/// Scheme of a storage URI (`file`, `memory`, ...), if any.
pub fn uri_scheme(uri: &str) -> Option<&str> {
    uri.split_once("://")
        .map(|(scheme, _)| scheme.trim())
        .filter(|s| !s.is_empty())
}

/// Convert a `file://` URI (or bare path) to a filesystem path.
pub fn file_uri_to_path(uri: &str) -> String {
    match uri.strip_prefix("file://") {
        Some(stripped) if stripped.starts_with('/') => stripped.to_string(),
        Some(stripped) => format!("/{}", stripped),
        None => uri.to_string(),
    }
}
