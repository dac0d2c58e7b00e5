//! Global Result Table.
//!
//! A replicated map from task identity to what is known about that task:
//! its result, or an orphan marker left by a worker that had to abort a
//! subtree whose parent died. Entries are also indexed by
//! `(parent identity, spawn index)` so a re-executed parent can find the
//! results of children it spawned in its previous life.
//!
//! Inserts never overwrite a result. A result replaces an orphan marker.

use crate::engine::types::{Stamp, TaskOutcome, WorkerId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum GrtValue {
    Result(TaskOutcome),
    Orphan,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrtEntry {
    pub key: Stamp,
    pub parent: Option<Stamp>,
    pub spawn_index: u32,
    pub value: GrtValue,
    /// Worker that produced the entry.
    pub holder: WorkerId,
}

impl GrtEntry {
    pub fn result(
        key: Stamp,
        parent: Option<Stamp>,
        spawn_index: u32,
        outcome: TaskOutcome,
        holder: WorkerId,
    ) -> Self {
        Self {
            key,
            parent,
            spawn_index,
            value: GrtValue::Result(outcome),
            holder,
        }
    }

    pub fn orphan(key: Stamp, parent: Option<Stamp>, spawn_index: u32, holder: WorkerId) -> Self {
        Self {
            key,
            parent,
            spawn_index,
            value: GrtValue::Orphan,
            holder,
        }
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        match &self.value {
            GrtValue::Result(outcome) => Some(outcome),
            GrtValue::Orphan => None,
        }
    }
}

pub struct GlobalResultTable {
    entries: DashMap<Stamp, GrtEntry>,
    by_position: DashMap<(Stamp, u32), Stamp>,
    /// Local inserts not yet broadcast.
    outbox: Mutex<Vec<GrtEntry>>,
}

impl GlobalResultTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            by_position: DashMap::new(),
            outbox: Mutex::new(Vec::new()),
        })
    }

    /// Inserts a locally produced entry and queues it for broadcast.
    pub fn store(&self, entry: GrtEntry) -> bool {
        let accepted = self.insert(entry.clone());
        if accepted {
            self.outbox.lock().push(entry);
        }
        accepted
    }

    /// Inserts without broadcasting.
    pub fn store_local(&self, entry: GrtEntry) -> bool {
        self.insert(entry)
    }

    /// Applies entries broadcast by a peer.
    pub fn merge(&self, entries: Vec<GrtEntry>) -> usize {
        entries
            .into_iter()
            .filter(|entry| self.insert(entry.clone()))
            .count()
    }

    fn insert(&self, entry: GrtEntry) -> bool {
        let position = entry
            .parent
            .clone()
            .map(|parent| (parent, entry.spawn_index));
        let key = entry.key.clone();

        let accepted = match self.entries.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
            Entry::Occupied(mut slot) => {
                let upgrade = matches!(slot.get().value, GrtValue::Orphan)
                    && matches!(entry.value, GrtValue::Result(_));
                if upgrade {
                    slot.insert(entry);
                }
                upgrade
            }
        };

        if accepted {
            if let Some(position) = position {
                self.by_position.entry(position).or_insert(key);
            }
        }
        accepted
    }

    pub fn lookup(&self, key: &Stamp) -> Option<GrtEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn lookup_result(&self, key: &Stamp) -> Option<TaskOutcome> {
        self.entries
            .get(key)
            .and_then(|entry| entry.outcome().cloned())
    }

    /// Entry for the `index`-th child spawned by the task with identity `parent`.
    pub fn lookup_child(&self, parent: &Stamp, index: u32) -> Option<GrtEntry> {
        let key = self
            .by_position
            .get(&(parent.clone(), index))
            .map(|key| key.value().clone())?;
        self.lookup(&key)
    }

    pub fn take_outbox(&self) -> Vec<GrtEntry> {
        std::mem::take(&mut *self.outbox.lock())
    }

    /// Hands queued entries to `send` while still holding the outbox. A
    /// caller that finds the outbox empty knows every earlier entry has
    /// already been handed over.
    pub fn flush_with<F>(&self, send: F) -> usize
    where
        F: FnOnce(Vec<GrtEntry>),
    {
        let mut outbox = self.outbox.lock();
        if outbox.is_empty() {
            return 0;
        }
        let entries = std::mem::take(&mut *outbox);
        let count = entries.len();
        send(entries);
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
