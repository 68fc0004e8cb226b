//! Wave expansion: entities × prompts → tasks.

use cohort_core::id::{EntityId, TaskId, WaveNumber};
use cohort_core::types::{CacheKey, ConversationTurn, Role, RunRequest, Task};

use crate::error::{Result, StudyError};

const HISTORY_HEADER: &str = "Earlier in this conversation:";

/// First task id of `wave`: the number of tasks in all earlier waves.
pub fn wave_task_offset(req: &RunRequest, wave: WaveNumber) -> u64 {
    let entities = req.entities.len() as u64;
    req.waves
        .iter()
        .take_while(|w| w.wave < wave)
        .map(|w| entities * w.prompts.len() as u64)
        .sum()
}

/// Build the tasks for `wave`.
///
/// `history` returns an entity's turns from earlier waves; it is read once per
/// entity, before any task of the wave exists. Turns from `wave` itself or later
/// are ignored, so a wave's prompts never see that wave's own outputs.
pub fn plan_wave<F>(req: &RunRequest, wave: WaveNumber, history: F) -> Result<Vec<Task>>
where
    F: Fn(&EntityId) -> Vec<ConversationTurn>,
{
    let def = req
        .waves
        .iter()
        .find(|w| w.wave == wave)
        .ok_or_else(|| StudyError::Invalid(format!("{wave} is not defined")))?;

    let mut next_id = wave_task_offset(req, wave);
    let mut tasks = Vec::with_capacity(req.entities.len() * def.prompts.len());

    for entity in &req.entities {
        let prior: Vec<ConversationTurn> = history(&entity.id)
            .into_iter()
            .filter(|t| t.wave < wave)
            .collect();

        for prompt in &def.prompts {
            let prompt_text = render_prompt(&prior, &prompt.text, req.config.history_turns);
            let cache_key =
                CacheKey::derive(entity, &prompt_text, &req.config.model, &req.sampling)?;
            tasks.push(Task {
                task_id: TaskId::new(next_id),
                entity_id: entity.id.clone(),
                wave,
                prompt_id: prompt.id.clone(),
                question: prompt.text.clone(),
                prompt_text,
                sampling: req.sampling.clone(),
                cache_key,
            });
            next_id += 1;
        }
    }
    Ok(tasks)
}

/// Render the text sent to the model: the last `history_turns` turns (all when
/// `None`) as a transcript, then the question. No history → the bare question.
pub fn render_prompt(
    history: &[ConversationTurn],
    question: &str,
    history_turns: Option<usize>,
) -> String {
    let start = match history_turns {
        Some(n) => history.len().saturating_sub(n),
        None => 0,
    };
    let window = &history[start..];
    if window.is_empty() {
        return question.to_string();
    }

    let mut out = String::from(HISTORY_HEADER);
    out.push('\n');
    for turn in window {
        let speaker = match turn.role {
            Role::Requester => "Interviewer",
            Role::Responder => "You",
        };
        out.push_str(speaker);
        out.push_str(": ");
        out.push_str(turn.content.trim_end());
        out.push('\n');
    }
    out.push('\n');
    out.push_str(question);
    out
}
