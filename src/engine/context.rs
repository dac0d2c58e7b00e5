//! Task Context
//!
//! What a running job sees of the engine: spawn children, sync on them, read
//! their results, abort speculative work, and reach shared objects. One
//! context exists per running task frame.

use super::types::{ChildOutcome, Invocation, Stamp, WorkerId};
use super::worker::Worker;
use crate::error::EngineError;
use crate::shared::replicator::{SharedObject, SharedState};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub struct TaskContext<'w> {
    worker: &'w Worker,
    stamp: Stamp,
    /// Children collected by earlier syncs.
    resolved: BTreeMap<Stamp, ChildOutcome>,
}

impl<'w> TaskContext<'w> {
    pub(crate) fn new(worker: &'w Worker, stamp: Stamp) -> Self {
        Self {
            worker,
            stamp,
            resolved: BTreeMap::new(),
        }
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.worker.id()
    }

    /// Spawns a child running `job` with `args`. The child may run locally
    /// or be stolen; its result is available after the next `sync`.
    pub fn spawn<A: Serialize>(&mut self, job: &str, args: A) -> Result<Stamp, EngineError> {
        let args = serde_json::to_value(args)?;
        self.worker
            .spawn_child(&self.stamp, Invocation::new(job, args))
    }

    /// Blocks until every child spawned so far is finished or aborted. While
    /// waiting the worker runs its own queued tasks and steals from peers.
    ///
    /// Fails with `Aborted` when this task itself was aborted, and with
    /// `TaskFailed` when a child failed. In the latter case the failing
    /// child's pending siblings are aborted first.
    pub fn sync(&mut self) -> Result<(), EngineError> {
        let collected = self.worker.sync_children(&self.stamp)?;
        self.resolved.extend(collected);
        Ok(())
    }

    /// Aborts `child` and all of its descendants, wherever they run.
    pub fn abort(&mut self, child: &Stamp) {
        self.worker.abort_task(child);
    }

    /// Aborts every child that has not resolved yet.
    pub fn abort_all(&mut self) {
        self.worker.abort_children(&self.stamp);
    }

    pub fn is_aborted(&self) -> bool {
        self.worker.is_aborted(&self.stamp)
    }

    /// Cancellation checkpoint for long-running leaves.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_aborted() {
            return Err(EngineError::Aborted(self.stamp.clone()));
        }
        Ok(())
    }

    /// Outcome of a child, collected by sync or already available.
    pub fn outcome(&self, child: &Stamp) -> Option<ChildOutcome> {
        self.resolved
            .get(child)
            .cloned()
            .or_else(|| self.worker.peek_child(child))
    }

    pub fn result(&self, child: &Stamp) -> Option<Value> {
        match self.outcome(child)? {
            ChildOutcome::Finished(value) => Some(value),
            ChildOutcome::Aborted => None,
        }
    }

    pub fn result_as<T: DeserializeOwned>(&self, child: &Stamp) -> Result<T, EngineError> {
        let value = self
            .result(child)
            .ok_or_else(|| EngineError::NoResult(child.clone()))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Children collected so far, aborted ones included.
    pub fn outcomes(&self) -> impl Iterator<Item = (&Stamp, &ChildOutcome)> {
        self.resolved.iter()
    }

    /// Results of the finished children collected so far.
    pub fn results(&self) -> Vec<(Stamp, Value)> {
        self.resolved
            .iter()
            .filter_map(|(stamp, outcome)| match outcome {
                ChildOutcome::Finished(value) => Some((stamp.clone(), value.clone())),
                ChildOutcome::Aborted => None,
            })
            .collect()
    }

    pub fn shared<T: SharedState>(&self, id: &str) -> Option<SharedObject<T>> {
        self.worker.replicator().get(id)
    }
}
