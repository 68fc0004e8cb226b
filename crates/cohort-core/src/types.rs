//! Task, outcome, and conversation records shared by every layer.
//!
//! These are fixed-shape structs rather than loose maps so the wave number and
//! the cache-key inputs are always explicit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RunConfig;
use crate::error::Result;
use crate::hash::{hash_canonical, Hash256};
use crate::id::{EntityId, RunId, TaskId, WaveNumber};
use crate::manifest::RunManifest;

/// Sampling parameters forwarded to the generation endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Provider-specific knobs; hashed canonically like everything else.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            max_tokens: Some(512),
            seed: None,
            extra: BTreeMap::new(),
        }
    }
}

/// An entity as handed over by the entity source: an opaque id plus the
/// serializable snapshot that participates in cache keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: EntityId,
    #[serde(default)]
    pub attributes: Value,
}

impl EntitySnapshot {
    pub fn new(id: impl Into<String>, attributes: Value) -> Self {
        Self {
            id: EntityId::new(id),
            attributes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub id: String,
    pub text: String,
}

impl PromptSpec {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One ordered round of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveDefinition {
    pub wave: WaveNumber,
    pub prompts: Vec<PromptSpec>,
    /// When set, any terminal task failure in this wave aborts the run.
    #[serde(default = "default_true")]
    pub require_full_success: bool,
}

impl WaveDefinition {
    pub fn new(wave: u64, prompts: Vec<PromptSpec>) -> Self {
        Self {
            wave: WaveNumber::new(wave),
            prompts,
            require_full_success: true,
        }
    }
}

/// Everything needed to (re)start a run. Persisted inside checkpoints so a
/// fresh process can resume with nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub entities: Vec<EntitySnapshot>,
    pub waves: Vec<WaveDefinition>,
    pub sampling: SamplingParams,
    pub config: RunConfig,
}

/// One unit of work. Immutable once built by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub entity_id: EntityId,
    pub wave: WaveNumber,
    pub prompt_id: String,
    /// The bare prompt as authored; becomes the requester turn.
    pub question: String,
    /// The rendered prompt actually sent (history + question).
    pub prompt_text: String,
    pub sampling: SamplingParams,
    /// Derived at expansion from the entity snapshot, `prompt_text`, model and sampling.
    pub cache_key: CacheKey,
}

/// Content address of a response.
///
/// Derived from the entity snapshot, rendered prompt, model and sampling params.
/// Never includes task id or wave number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub Hash256);

#[derive(Serialize)]
struct KeyMaterial<'a> {
    entity: &'a Value,
    prompt_text: &'a str,
    model: &'a str,
    sampling: &'a SamplingParams,
}

impl CacheKey {
    pub fn derive(
        entity: &EntitySnapshot,
        prompt_text: &str,
        model: &str,
        sampling: &SamplingParams,
    ) -> Result<Self> {
        let material = KeyMaterial {
            entity: &entity.attributes,
            prompt_text,
            model,
            sampling,
        };
        Ok(CacheKey(hash_canonical(&material)?))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response_text: String,
    pub created_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Requester => write!(f, "requester"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    pub wave: WaveNumber,
    pub timestamp_ms: u64,
}

/// Failure taxonomy at the generation boundary, plus `Internal` for
/// executor-side failures (e.g. a worker that panicked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Malformed,
    Fatal,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success {
        response_text: String,
        /// Served from the cache without a generation call.
        cached: bool,
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_count: Option<u32>,
    },
    Failed {
        kind: ErrorKind,
        reason: String,
        attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub entity_id: EntityId,
    pub wave: WaveNumber,
    pub prompt_id: String,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success { .. })
    }

    pub fn response_text(&self) -> Option<&str> {
        match &self.status {
            OutcomeStatus::Success { response_text, .. } => Some(response_text),
            OutcomeStatus::Failed { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            OutcomeStatus::Success { .. } => None,
            OutcomeStatus::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Outcomes keyed by task id, persisted as a plain list (each outcome carries
/// its own id) so the JSON form never depends on integer map keys.
pub type OutcomeMap = BTreeMap<TaskId, TaskOutcome>;

pub mod outcome_list {
    use super::{OutcomeMap, TaskOutcome};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(map: &OutcomeMap, s: S) -> Result<S::Ok, S::Error> {
        let list: Vec<&TaskOutcome> = map.values().collect();
        list.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OutcomeMap, D::Error> {
        let list = Vec::<TaskOutcome>::deserialize(d)?;
        Ok(list.into_iter().map(|o| (o.task_id, o)).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled { wave: WaveNumber },
    Aborted { wave: WaveNumber, reason: String },
}

/// Final aggregate handed to result consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub run_id: RunId,
    pub manifest: RunManifest,
    pub status: RunStatus,
    pub committed_waves: Vec<WaveNumber>,
    #[serde(with = "outcome_list")]
    pub outcomes: OutcomeMap,
}

impl SimulationResult {
    pub fn is_complete(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.values().filter(|o| !o.is_success())
    }

    pub fn outcomes_for_wave(&self, wave: WaveNumber) -> impl Iterator<Item = &TaskOutcome> {
        self.outcomes.values().filter(move |o| o.wave == wave)
    }
}
