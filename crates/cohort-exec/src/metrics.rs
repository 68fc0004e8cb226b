//! Execution counters.
//!
//! Plain atomics shared by the executor and its workers; a snapshot is logged
//! through `tracing` at the end of each wave. Exporters belong in the binary.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use cohort_core::id::{RunId, WaveNumber};

#[derive(Debug, Default)]
pub struct ExecMetrics {
    launched: AtomicU64,
    cache_hits: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    failures: AtomicU64,
    checkpoints: AtomicU64,
    peak_in_flight: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks that went to the generation client (cache misses).
    pub launched: u64,
    pub cache_hits: u64,
    /// Attempts beyond the first, across all tasks.
    pub retries: u64,
    pub rate_limited: u64,
    /// Tasks with a terminal failure outcome.
    pub failures: u64,
    pub checkpoints: u64,
    pub peak_in_flight: usize,
}

impl ExecMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_launch(&self) {
        self.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_in_flight(&self, n: usize) {
        self.peak_in_flight.fetch_max(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            launched: self.launched.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Log the counters as one structured event under a `wave_summary` span.
    pub fn emit_summary(&self, run_id: &RunId, wave: WaveNumber) {
        let s = self.snapshot();
        let span = tracing::info_span!("wave_summary", run_id = %run_id, wave = %wave);
        let _enter = span.enter();
        tracing::info!(
            launched = s.launched,
            cache_hits = s.cache_hits,
            retries = s.retries,
            rate_limited = s.rate_limited,
            failures = s.failures,
            checkpoints = s.checkpoints,
            peak_in_flight = s.peak_in_flight,
            "wave metrics"
        );
    }
}
