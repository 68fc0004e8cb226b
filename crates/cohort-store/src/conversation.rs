//! Per-entity conversation memory.
//!
//! Each entity has its own turn log behind its own mutex, so appends for
//! different entities never contend. Within one entity, turns are ordered by
//! wave, each wave holds at most one requester and one responder turn, and a
//! responder turn needs the requester turn of the same wave before it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use cohort_core::id::{EntityId, WaveNumber};
use cohort_core::types::{ConversationTurn, Role};

use crate::error::{Error, Result};

type Log = Arc<Mutex<Vec<ConversationTurn>>>;

#[derive(Default)]
pub struct ConversationStore {
    partitions: RwLock<HashMap<EntityId, Log>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, entity: &EntityId) -> Option<Log> {
        self.partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity)
            .cloned()
    }

    fn partition_or_insert(&self, entity: &EntityId) -> Log {
        if let Some(log) = self.partition(entity) {
            return log;
        }
        self.partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(entity.clone())
            .or_default()
            .clone()
    }

    /// Append one turn to `entity`'s log, enforcing wave order.
    pub fn append(&self, entity: &EntityId, turn: ConversationTurn) -> Result<()> {
        let log = self.partition_or_insert(entity);
        let mut turns = log.lock().unwrap_or_else(|e| e.into_inner());

        let reject = |reason: String| Error::ConversationOrder {
            entity: entity.to_string(),
            reason,
        };

        if let Some(last) = turns.last() {
            if turn.wave < last.wave {
                return Err(reject(format!(
                    "{} turn for {} after a turn for {}",
                    turn.role, turn.wave, last.wave
                )));
            }
        }

        let in_wave = turns.iter().filter(|t| t.wave == turn.wave);
        let mut has_requester = false;
        for t in in_wave {
            if t.role == turn.role {
                return Err(reject(format!("duplicate {} turn for {}", turn.role, turn.wave)));
            }
            has_requester |= t.role == Role::Requester;
        }
        if turn.role == Role::Responder && !has_requester {
            return Err(reject(format!(
                "responder turn for {} without a requester turn",
                turn.wave
            )));
        }

        turns.push(turn);
        Ok(())
    }

    /// Full history for `entity`, oldest first. Empty if none recorded.
    pub fn read(&self, entity: &EntityId) -> Vec<ConversationTurn> {
        self.partition(entity)
            .map(|log| log.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .unwrap_or_default()
    }

    /// History strictly before `wave`; the view a prompt for `wave` is rendered from.
    pub fn read_before(&self, entity: &EntityId, wave: WaveNumber) -> Vec<ConversationTurn> {
        self.partition(entity)
            .map(|log| {
                log.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .filter(|t| t.wave < wave)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self, entity: &EntityId) {
        self.partitions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity);
    }

    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .partitions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Copy of every log, for checkpointing.
    pub fn snapshot(&self) -> BTreeMap<EntityId, Vec<ConversationTurn>> {
        let partitions = self.partitions.read().unwrap_or_else(|e| e.into_inner());
        partitions
            .iter()
            .map(|(id, log)| {
                let turns = log.lock().unwrap_or_else(|e| e.into_inner()).clone();
                (id.clone(), turns)
            })
            .filter(|(_, turns)| !turns.is_empty())
            .collect()
    }

    /// Replace all memory with `snapshot` (resume path).
    pub fn restore(&self, snapshot: BTreeMap<EntityId, Vec<ConversationTurn>>) {
        let rebuilt: HashMap<EntityId, Log> = snapshot
            .into_iter()
            .map(|(id, turns)| (id, Arc::new(Mutex::new(turns))))
            .collect();
        *self.partitions.write().unwrap_or_else(|e| e.into_inner()) = rebuilt;
    }
}
