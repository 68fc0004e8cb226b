//! Convenient re-exports for downstream crates.

pub use crate::checkpoint::{Checkpoint, CheckpointPhase, PartialResult};
pub use crate::config::{RetryPolicy, RunConfig, StoreConfig};
pub use crate::error::{Error, Result};
pub use crate::hash::Hash256;
pub use crate::id::{EntityId, RunId, TaskId, WaveNumber};
pub use crate::manifest::{now_millis, RunManifest, WaveFingerprint};
pub use crate::types::{
    CacheEntry, CacheKey, ConversationTurn, EntitySnapshot, ErrorKind, OutcomeMap, OutcomeStatus,
    PromptSpec, Role, RunRequest, RunStatus, SamplingParams, SimulationResult, Task, TaskOutcome,
    WaveDefinition,
};
