//! Coarse work estimation for `explain`.
//!
//! Counts only; no latency model. Upper bounds assume every call exhausts its
//! retry budget and no response is served from the cache.

use serde::{Deserialize, Serialize};

use cohort_core::id::WaveNumber;
use cohort_core::types::RunRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveEstimate {
    pub wave: WaveNumber,
    pub prompts: usize,
    pub tasks: usize,
    /// Launch rounds at full concurrency: ceil(tasks / concurrency_limit).
    pub rounds: usize,
    pub require_full_success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkEstimate {
    pub entities: usize,
    pub waves: Vec<WaveEstimate>,
    pub total_tasks: usize,
    /// `total_tasks × retry.max_attempts`.
    pub max_generation_calls: usize,
}

pub fn estimate_work(req: &RunRequest) -> WorkEstimate {
    let entities = req.entities.len();
    let limit = req.config.concurrency_limit.max(1);

    let waves: Vec<WaveEstimate> = req
        .waves
        .iter()
        .map(|w| {
            let tasks = entities * w.prompts.len();
            WaveEstimate {
                wave: w.wave,
                prompts: w.prompts.len(),
                tasks,
                rounds: tasks.div_ceil(limit),
                require_full_success: w.require_full_success,
            }
        })
        .collect();

    let total_tasks = waves.iter().map(|w| w.tasks).sum();
    WorkEstimate {
        entities,
        total_tasks,
        max_generation_calls: total_tasks * req.config.retry.max_attempts as usize,
        waves,
    }
}
