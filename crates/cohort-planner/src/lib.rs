#![forbid(unsafe_code)]
//! cohort-planner: from (YAML) study documents → validated `RunRequest`
//! → per-wave task lists with rendered prompts and cache keys.
//!
//! Design:
//! - `dsl::yaml` parses the study document and its optional `config:` block.
//! - `validate` checks a `RunRequest` before anything is executed.
//! - `expand` builds one wave's tasks from the entities, the wave's prompts and
//!   each entity's prior conversation. Task ids are assigned deterministically
//!   (wave order, then entity order, then prompt order), so a fresh process
//!   rebuilds the same ids on resume.
//! - `estimate` gives the coarse work numbers printed by `cohort explain`.
//!
//! No async and no I/O here; conversation history is passed in by the caller.

pub mod dsl;
pub mod error;
pub mod estimate;
pub mod expand;
pub mod validate;

pub use dsl::yaml::{parse_yaml_study, ParsedStudy, StudyConfig};
pub use error::{Result, StudyError};
pub use estimate::{estimate_work, WorkEstimate};
pub use expand::{plan_wave, render_prompt, wave_task_offset};
pub use validate::validate_request;
