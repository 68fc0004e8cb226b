//! Progress events pushed to an optional observer.
//!
//! The executor and orchestrator send; observers (a CLI progress line, a test)
//! receive on an unbounded channel so a slow observer never stalls a wave.

use serde::Serialize;
use tokio::sync::mpsc;

use cohort_core::id::{EntityId, TaskId, WaveNumber};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    WaveStarted {
        wave: WaveNumber,
        tasks: usize,
        /// Tasks skipped because a checkpoint already holds their outcome.
        already_done: usize,
    },
    TaskCompleted {
        task_id: TaskId,
        entity_id: EntityId,
        wave: WaveNumber,
        success: bool,
        cached: bool,
    },
    CheckpointSaved {
        wave: WaveNumber,
        completed: usize,
        remaining: usize,
    },
    CheckpointFailed {
        wave: WaveNumber,
        error: String,
    },
    ConcurrencyChanged {
        limit: usize,
    },
    WaveCommitted {
        wave: WaveNumber,
    },
}

/// Cloneable sender half; a sink without a receiver drops events.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn from_sender(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is watching.
            let _ = tx.send(event);
        }
    }
}
