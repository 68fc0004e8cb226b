//! Pre-flight checks on a `RunRequest`.

use std::collections::HashSet;

use cohort_core::types::RunRequest;

use crate::error::{Result, StudyError};

/// Reject requests the engine cannot run deterministically:
/// - at least one entity, with unique non-empty ids
/// - waves numbered 1..=n in order, each with at least one prompt
/// - prompt ids unique within a wave, prompt text non-empty
/// - a valid `RunConfig`
pub fn validate_request(req: &RunRequest) -> Result<()> {
    req.config.validate()?;

    if req.entities.is_empty() {
        return Err(StudyError::Invalid("no entities".into()));
    }
    let mut seen = HashSet::new();
    for e in &req.entities {
        if e.id.as_str().trim().is_empty() {
            return Err(StudyError::Invalid("entity with empty id".into()));
        }
        if !seen.insert(e.id.as_str()) {
            return Err(StudyError::Invalid(format!("duplicate entity id '{}'", e.id)));
        }
    }

    if req.waves.is_empty() {
        return Err(StudyError::Invalid("no waves".into()));
    }
    for (i, w) in req.waves.iter().enumerate() {
        let expected = i as u64 + 1;
        if w.wave.get() != expected {
            return Err(StudyError::Invalid(format!(
                "{} found where wave-{expected} was expected",
                w.wave
            )));
        }
        if w.prompts.is_empty() {
            return Err(StudyError::Invalid(format!("{} has no prompts", w.wave)));
        }
        let mut ids = HashSet::new();
        for p in &w.prompts {
            if !ids.insert(p.id.as_str()) {
                return Err(StudyError::Invalid(format!(
                    "duplicate prompt id '{}' in {}",
                    p.id, w.wave
                )));
            }
            if p.text.trim().is_empty() {
                return Err(StudyError::Invalid(format!(
                    "prompt '{}' in {} is empty",
                    p.id, w.wave
                )));
            }
        }
    }
    Ok(())
}
