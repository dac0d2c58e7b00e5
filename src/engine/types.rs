use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type WorkerId = NodeId;

/// Globally unique task identity: originating worker + that worker's local counter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Stamp {
    pub origin: WorkerId,
    pub seq: u64,
}

impl Stamp {
    pub fn new(origin: WorkerId, seq: u64) -> Self {
        Self { origin, seq }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// Lifecycle of a task record.
///
/// `Finished -> Aborted` is allowed only while the result has not yet been
/// collected by the parent's sync: an abort must hide a result that is
/// already sitting in the slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Spawned,
    Stolen,
    Running,
    Finished,
    Aborted,
    Stored,
}

impl TaskState {
    pub fn can_become(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Spawned, Stolen)
                | (Spawned, Running)
                | (Spawned, Aborted)
                | (Stolen, Running)
                | (Stolen, Aborted)
                | (Stolen, Finished)
                | (Running, Finished)
                | (Running, Aborted)
                | (Finished, Stored)
                | (Finished, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Aborted | TaskState::Stored)
    }

    /// Resolved tasks no longer hold up their parent's sync.
    pub fn is_resolved(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Aborted | TaskState::Stored
        )
    }
}

/// The opaque payload of a spawn: which registered job to run, with which arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invocation {
    pub job: String,
    pub args: serde_json::Value,
}

impl Invocation {
    pub fn new(job: &str, args: serde_json::Value) -> Self {
        Self {
            job: job.to_string(),
            args,
        }
    }
}

/// What a finished task produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskOutcome {
    Value(serde_json::Value),
    Failed { error: String },
}

/// What a parent sees for one child after sync.
#[derive(Debug, Clone, PartialEq)]
pub enum ChildOutcome {
    Finished(serde_json::Value),
    Aborted,
}

/// One spawn call, held in mutable form by exactly one worker.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub stamp: Stamp,
    pub owner: WorkerId,
    pub parent: Option<Stamp>,
    /// The parent's Global Result Table identity.
    pub parent_key: Option<Stamp>,
    /// Worker holding the parent; results are reported there.
    pub spawner: WorkerId,
    /// Ancestors, root first. Ancestry tests use this, never `children`.
    pub lineage: Vec<Stamp>,
    /// Position among the parent's spawns.
    pub spawn_index: u32,
    /// Children spawned so far. Unlike `children`, never shrinks at sync.
    pub spawn_count: u32,
    pub children: Vec<Stamp>,
    pub invocation: Invocation,
    pub result: Option<TaskOutcome>,
    pub state: TaskState,
    /// Original identity when this record re-executes a task lost with a dead worker.
    pub redo_of: Option<Stamp>,
}

impl TaskRecord {
    /// Identity used for Global Result Table keys: survives re-spawning.
    pub fn identity(&self) -> &Stamp {
        self.redo_of.as_ref().unwrap_or(&self.stamp)
    }

    pub fn is_descendant_of(&self, ancestor: &Stamp) -> bool {
        self.lineage.contains(ancestor)
    }

    pub fn is_in_subtree_of(&self, root: &Stamp) -> bool {
        &self.stamp == root || self.is_descendant_of(root)
    }

    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.can_become(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Consumes the record for shipping to a thief. Only the stamp and the
    /// bookkeeping needed for ancestry survive the move.
    pub fn ship(self) -> ShippedTask {
        ShippedTask {
            stamp: self.stamp,
            parent: self.parent,
            parent_key: self.parent_key,
            spawner: self.spawner,
            lineage: self.lineage,
            spawn_index: self.spawn_index,
            invocation: self.invocation,
            redo_of: self.redo_of,
        }
    }
}

/// A task record in transit from victim to thief.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShippedTask {
    pub stamp: Stamp,
    pub parent: Option<Stamp>,
    pub parent_key: Option<Stamp>,
    pub spawner: WorkerId,
    pub lineage: Vec<Stamp>,
    pub spawn_index: u32,
    pub invocation: Invocation,
    pub redo_of: Option<Stamp>,
}

impl ShippedTask {
    pub fn identity(&self) -> &Stamp {
        self.redo_of.as_ref().unwrap_or(&self.stamp)
    }

    pub fn into_record(self, owner: WorkerId) -> TaskRecord {
        TaskRecord {
            stamp: self.stamp,
            owner,
            parent: self.parent,
            parent_key: self.parent_key,
            spawner: self.spawner,
            lineage: self.lineage,
            spawn_index: self.spawn_index,
            spawn_count: 0,
            children: Vec::new(),
            invocation: self.invocation,
            result: None,
            state: TaskState::Stolen,
            redo_of: self.redo_of,
        }
    }
}

/// What the victim keeps after a steal: enough to resolve sync and route aborts,
/// plus the invocation so the task can be re-spawned if the thief dies.
#[derive(Debug, Clone)]
pub struct StolenEcho {
    pub stamp: Stamp,
    pub thief: WorkerId,
    pub parent: Option<Stamp>,
    pub parent_key: Option<Stamp>,
    pub lineage: Vec<Stamp>,
    pub spawn_index: u32,
    pub invocation: Invocation,
    pub redo_of: Option<Stamp>,
    pub state: TaskState,
    pub result: Option<TaskOutcome>,
}

impl StolenEcho {
    pub fn identity(&self) -> &Stamp {
        self.redo_of.as_ref().unwrap_or(&self.stamp)
    }

    pub fn is_in_subtree_of(&self, root: &Stamp) -> bool {
        &self.stamp == root || self.lineage.contains(root)
    }
}
