//! YAML → study definition.
//!
//! Example:
//! ```yaml
//! config:
//!   model: llama3
//!   concurrency_limit: 8
//!   checkpoint_uri: file:///var/lib/cohort/checkpoints
//! sampling: { temperature: 0.2, seed: 7 }
//! entities:
//!   - id: p-1
//!     attributes: { age: 34, occupation: nurse }
//!   - id: p-2
//!     attributes: { age: 61, occupation: farmer }
//! waves:
//!   - prompts:
//!       - { id: q1, text: "How do you usually get to work?" }
//!   - require_full_success: false
//!     prompts:
//!       - { id: q2, text: "Has that changed since we last spoke?" }
//! ```
//!
//! A single-wave study may list `prompts:` at the top level instead of `waves:`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cohort_core::config::{RunConfig, StoreConfig};
use cohort_core::types::{EntitySnapshot, PromptSpec, RunRequest, SamplingParams, WaveDefinition};

use crate::error::{Result, StudyError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudyDoc {
    #[serde(default)]
    pub config: Option<StudyConfig>,
    #[serde(default)]
    pub sampling: Option<SamplingDef>,
    pub entities: Vec<EntitySnapshot>,
    #[serde(default)]
    pub prompts: Vec<PromptSpec>,
    #[serde(default)]
    pub waves: Vec<WaveDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WaveDef {
    /// Optional explicit number; must match the wave's position (1-based).
    #[serde(default)]
    pub wave: Option<u64>,
    pub prompts: Vec<PromptSpec>,
    #[serde(default = "default_true")]
    pub require_full_success: bool,
}

fn default_true() -> bool {
    true
}

/// Sampling block; anything omitted keeps the engine default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingDef {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub extra: BTreeMap<String, Value>,
}

impl SamplingDef {
    pub fn resolve(&self) -> SamplingParams {
        let mut s = SamplingParams::default();
        if let Some(t) = self.temperature {
            s.temperature = t;
        }
        if self.top_p.is_some() {
            s.top_p = self.top_p;
        }
        if self.max_tokens.is_some() {
            s.max_tokens = self.max_tokens;
        }
        s.seed = self.seed;
        s.extra = self.extra.clone();
        s
    }
}

/// Optional run settings carried by the study document. Applied on top of
/// defaults and environment, below command-line flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StudyConfig {
    pub model: Option<String>,
    pub concurrency_limit: Option<usize>,
    pub request_timeout_ms: Option<u64>,
    pub checkpoint_every: Option<usize>,
    pub checkpoint_interval_ms: Option<u64>,
    pub retry_max_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
    pub retry_max_delay_ms: Option<u64>,
    pub adaptive_concurrency: Option<bool>,
    pub history_turns: Option<usize>,
    pub cache_uri: Option<String>,
    pub checkpoint_uri: Option<String>,
    /// Record compression for both stores.
    pub store_codec: Option<String>,
}

impl StudyConfig {
    pub fn apply_to(&self, cfg: &mut RunConfig) {
        if let Some(v) = &self.model {
            cfg.model = v.clone();
        }
        if let Some(v) = self.concurrency_limit {
            cfg.concurrency_limit = v;
        }
        if let Some(v) = self.request_timeout_ms {
            cfg.request_timeout_ms = v;
        }
        if let Some(v) = self.checkpoint_every {
            cfg.checkpoint_every = v;
        }
        if let Some(v) = self.checkpoint_interval_ms {
            cfg.checkpoint_interval_ms = v;
        }
        if let Some(v) = self.retry_max_attempts {
            cfg.retry.max_attempts = v;
        }
        if let Some(v) = self.retry_base_delay_ms {
            cfg.retry.base_delay_ms = v;
        }
        if let Some(v) = self.retry_max_delay_ms {
            cfg.retry.max_delay_ms = v;
        }
        if let Some(v) = self.adaptive_concurrency {
            cfg.adaptive_concurrency = v;
        }
        if self.history_turns.is_some() {
            cfg.history_turns = self.history_turns;
        }
    }

    pub fn apply_store(&self, store: &mut StoreConfig) {
        store.merge(&StoreConfig {
            cache_uri: self.cache_uri.clone(),
            checkpoint_uri: self.checkpoint_uri.clone(),
            codec: self.store_codec.clone(),
        });
    }
}

#[derive(Debug, Clone)]
pub struct ParsedStudy {
    pub entities: Vec<EntitySnapshot>,
    pub waves: Vec<WaveDefinition>,
    pub sampling: SamplingParams,
    pub config: StudyConfig,
}

impl ParsedStudy {
    /// Combine with a fully resolved `RunConfig`.
    ///
    /// The caller decides precedence: typically `config.apply_to(&mut cfg)`
    /// first, then command-line overrides, then this.
    pub fn into_request(self, config: RunConfig) -> RunRequest {
        RunRequest {
            entities: self.entities,
            waves: self.waves,
            sampling: self.sampling,
            config,
        }
    }
}

/// Parse a study document. Structural problems that serde cannot see (both
/// `prompts` and `waves`, misnumbered waves) are reported as `Invalid`.
pub fn parse_yaml_study(yaml_src: &str) -> Result<ParsedStudy> {
    let doc: StudyDoc = serde_yaml::from_str(yaml_src)?;

    let waves = match (doc.prompts.is_empty(), doc.waves.is_empty()) {
        (false, false) => {
            return Err(StudyError::Invalid(
                "use either top-level 'prompts' or 'waves', not both".into(),
            ))
        }
        (false, true) => vec![WaveDefinition::new(1, doc.prompts)],
        (true, false) => doc
            .waves
            .into_iter()
            .enumerate()
            .map(|(i, def)| {
                let position = i as u64 + 1;
                match def.wave {
                    Some(n) if n != position => Err(StudyError::Invalid(format!(
                        "wave {n} is listed in position {position}; waves must be numbered 1, 2, 3, ..."
                    ))),
                    _ => Ok(WaveDefinition {
                        require_full_success: def.require_full_success,
                        ..WaveDefinition::new(position, def.prompts)
                    }),
                }
            })
            .collect::<Result<Vec<_>>>()?,
        (true, true) => return Err(StudyError::Invalid("study has no prompts".into())),
    };

    Ok(ParsedStudy {
        entities: doc.entities,
        waves,
        sampling: doc.sampling.unwrap_or_default().resolve(),
        config: doc.config.unwrap_or_default(),
    })
}
