//! Per-worker Task Stack.
//!
//! Holds every task record the worker owns, the ready deque of spawned but
//! not yet started records, and the echoes of records stolen by peers. Local
//! execution takes the newest ready record; thieves take the oldest.
//!
//! The stack is plain data. The worker guards it with its state mutex and
//! performs all messaging; methods here only return what has to be sent.

use super::types::{
    ChildOutcome, Invocation, ShippedTask, Stamp, StolenEcho, TaskOutcome, TaskRecord, TaskState,
    WorkerId,
};
use crate::error::EngineError;
use crate::fault::grt::GrtEntry;

use std::collections::{HashMap, HashSet, VecDeque};

/// A ready record claimed for local execution.
#[derive(Debug, Clone)]
pub struct ReadyTask {
    pub stamp: Stamp,
    pub invocation: Invocation,
    pub redo_of: Option<Stamp>,
    /// The worker it was stolen from, for stolen records.
    pub source: Option<WorkerId>,
}

/// What the worker must do after a task completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The parent lives here; the result waits in the record for its sync.
    Local,
    /// The task was stolen; report to the worker holding its parent.
    Report {
        to: WorkerId,
        stamp: Stamp,
        outcome: TaskOutcome,
    },
    Root(TaskOutcome),
    /// The task was aborted; its result is dropped.
    Discarded,
}

/// An abort that must follow a stolen task to its thief.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortForward {
    pub to: WorkerId,
    pub stamp: Stamp,
}

#[derive(Debug, Default)]
pub struct KillReport {
    pub aborted: usize,
    pub forwards: Vec<AbortForward>,
}

/// One collected child: its outcome, or `None` when it was aborted.
pub type Collected = (Stamp, Option<TaskOutcome>);

pub struct TaskStack {
    local: WorkerId,
    next_seq: u64,
    records: HashMap<Stamp, TaskRecord>,
    ready: VecDeque<Stamp>,
    echoes: HashMap<Stamp, StolenEcho>,
    /// Re-spawned records, mapped to the stamp their parent was handed at spawn.
    handles: HashMap<Stamp, Stamp>,
    /// Every stolen stamp ever installed here.
    accepted: HashSet<Stamp>,
}

impl TaskStack {
    pub fn new(local: WorkerId) -> Self {
        Self {
            local,
            next_seq: 0,
            records: HashMap::new(),
            ready: VecDeque::new(),
            echoes: HashMap::new(),
            handles: HashMap::new(),
            accepted: HashSet::new(),
        }
    }

    pub fn local_id(&self) -> &WorkerId {
        &self.local
    }

    fn next_stamp(&mut self) -> Stamp {
        self.next_seq += 1;
        Stamp::new(self.local.clone(), self.next_seq)
    }

    /// Creates the root record, already running.
    pub fn start_root(&mut self, invocation: Invocation) -> Stamp {
        let stamp = self.next_stamp();
        let record = TaskRecord {
            stamp: stamp.clone(),
            owner: self.local.clone(),
            parent: None,
            parent_key: None,
            spawner: self.local.clone(),
            lineage: Vec::new(),
            spawn_index: 0,
            spawn_count: 0,
            children: Vec::new(),
            invocation,
            result: None,
            state: TaskState::Running,
            redo_of: None,
        };
        self.records.insert(stamp.clone(), record);
        stamp
    }

    /// Creates a child of `parent` and pushes it on the ready deque.
    pub fn spawn(
        &mut self,
        parent: &Stamp,
        invocation: Invocation,
        redo_of: Option<Stamp>,
    ) -> Result<Stamp, EngineError> {
        let stamp = self.new_child(parent, invocation, redo_of, None)?;
        self.ready.push_back(stamp.clone());
        Ok(stamp)
    }

    /// Creates a child of `parent` whose result is already known.
    pub fn spawn_finished(
        &mut self,
        parent: &Stamp,
        invocation: Invocation,
        redo_of: Option<Stamp>,
        outcome: TaskOutcome,
    ) -> Result<Stamp, EngineError> {
        self.new_child(parent, invocation, redo_of, Some(outcome))
    }

    fn new_child(
        &mut self,
        parent: &Stamp,
        invocation: Invocation,
        redo_of: Option<Stamp>,
        outcome: Option<TaskOutcome>,
    ) -> Result<Stamp, EngineError> {
        let (lineage, parent_key, spawn_index) = {
            let record = self
                .records
                .get(parent)
                .ok_or_else(|| EngineError::UnknownTask(parent.clone()))?;
            if record.state == TaskState::Aborted {
                return Err(EngineError::Aborted(parent.clone()));
            }
            let mut lineage = record.lineage.clone();
            lineage.push(parent.clone());
            (lineage, record.identity().clone(), record.spawn_count)
        };

        let stamp = self.next_stamp();
        let state = if outcome.is_some() {
            TaskState::Finished
        } else {
            TaskState::Spawned
        };
        let record = TaskRecord {
            stamp: stamp.clone(),
            owner: self.local.clone(),
            parent: Some(parent.clone()),
            parent_key: Some(parent_key),
            spawner: self.local.clone(),
            lineage,
            spawn_index,
            spawn_count: 0,
            children: Vec::new(),
            invocation,
            result: outcome,
            state,
            redo_of,
        };
        self.records.insert(stamp.clone(), record);
        if let Some(parent) = self.records.get_mut(parent) {
            parent.spawn_count += 1;
            parent.children.push(stamp.clone());
        }
        Ok(stamp)
    }

    /// Index the next child of `parent` will get, and the parent's redo identity.
    pub fn next_child_slot(&self, parent: &Stamp) -> Option<(u32, Option<Stamp>)> {
        self.records
            .get(parent)
            .map(|record| (record.spawn_count, record.redo_of.clone()))
    }

    /// Claims the newest ready record for local execution.
    pub fn pop_newest(&mut self) -> Option<ReadyTask> {
        while let Some(stamp) = self.ready.pop_back() {
            if let Some(record) = self.records.get_mut(&stamp) {
                if record.transition(TaskState::Running) {
                    return Some(ReadyTask {
                        stamp,
                        invocation: record.invocation.clone(),
                        redo_of: record.redo_of.clone(),
                        source: None,
                    });
                }
            }
        }
        None
    }

    /// Hands the oldest ready record to `thief`, leaving an echo behind.
    pub fn steal_oldest(&mut self, thief: &WorkerId) -> Option<ShippedTask> {
        while let Some(stamp) = self.ready.pop_front() {
            let eligible = self
                .records
                .get(&stamp)
                .map(|record| record.state == TaskState::Spawned)
                .unwrap_or(false);
            if !eligible {
                continue;
            }
            let Some(mut record) = self.records.remove(&stamp) else {
                continue;
            };

            record.transition(TaskState::Stolen);
            record.owner = thief.clone();
            self.echoes.insert(
                stamp.clone(),
                StolenEcho {
                    stamp: stamp.clone(),
                    thief: thief.clone(),
                    parent: record.parent.clone(),
                    parent_key: record.parent_key.clone(),
                    lineage: record.lineage.clone(),
                    spawn_index: record.spawn_index,
                    invocation: record.invocation.clone(),
                    redo_of: record.redo_of.clone(),
                    state: TaskState::Stolen,
                    result: None,
                },
            );
            return Some(record.ship());
        }
        None
    }

    /// Undoes a steal whose reply could not be sent.
    pub fn unsteal(&mut self, stamp: &Stamp) -> bool {
        let Some(echo) = self.echoes.remove(stamp) else {
            return false;
        };
        if echo.state != TaskState::Stolen {
            self.echoes.insert(stamp.clone(), echo);
            return false;
        }
        let record = self.record_from_echo(echo, stamp.clone());
        self.records.insert(stamp.clone(), record);
        self.ready.push_front(stamp.clone());
        true
    }

    fn record_from_echo(&self, echo: StolenEcho, stamp: Stamp) -> TaskRecord {
        TaskRecord {
            stamp,
            owner: self.local.clone(),
            parent: echo.parent,
            parent_key: echo.parent_key,
            spawner: self.local.clone(),
            lineage: echo.lineage,
            spawn_index: echo.spawn_index,
            spawn_count: 0,
            children: Vec::new(),
            invocation: echo.invocation,
            result: None,
            state: TaskState::Spawned,
            redo_of: echo.redo_of,
        }
    }

    /// Installs a task received in a steal reply. It stays `Stolen` until the
    /// executor claims it, so an abort arriving first still finds it.
    ///
    /// Returns `None` for a stamp this stack has held before: a redelivered
    /// reply must neither reset a running record nor revive a finished one.
    pub fn accept_stolen(&mut self, task: ShippedTask) -> Option<Stamp> {
        if self.accepted.contains(&task.stamp)
            || self.records.contains_key(&task.stamp)
            || self.echoes.contains_key(&task.stamp)
        {
            return None;
        }
        let record = task.into_record(self.local.clone());
        let stamp = record.stamp.clone();
        self.accepted.insert(stamp.clone());
        self.records.insert(stamp.clone(), record);
        Some(stamp)
    }

    /// Starts a stolen record. An aborted one is dropped instead.
    pub fn claim_stolen(&mut self, stamp: &Stamp) -> Option<ReadyTask> {
        let record = self.records.get_mut(stamp)?;
        if record.transition(TaskState::Running) {
            return Some(ReadyTask {
                stamp: stamp.clone(),
                invocation: record.invocation.clone(),
                redo_of: record.redo_of.clone(),
                source: Some(record.spawner.clone()),
            });
        }
        if record.state == TaskState::Aborted {
            self.records.remove(stamp);
        }
        None
    }

    /// The record currently standing for `handle`: itself, or its re-spawn.
    fn current(&self, handle: &Stamp) -> Stamp {
        self.handles
            .iter()
            .find(|(_, original)| *original == handle)
            .map(|(current, _)| current.clone())
            .unwrap_or_else(|| handle.clone())
    }

    pub fn state_of(&self, stamp: &Stamp) -> Option<TaskState> {
        self.records
            .get(stamp)
            .map(|record| record.state)
            .or_else(|| self.echoes.get(stamp).map(|echo| echo.state))
    }

    pub fn is_aborted(&self, stamp: &Stamp) -> bool {
        matches!(self.state_of(stamp), Some(TaskState::Aborted))
    }

    pub fn record(&self, stamp: &Stamp) -> Option<&TaskRecord> {
        self.records.get(stamp)
    }

    pub fn echo(&self, stamp: &Stamp) -> Option<&StolenEcho> {
        self.echoes.get(stamp)
    }

    fn child_result(&self, stamp: &Stamp) -> Option<&TaskOutcome> {
        self.records
            .get(stamp)
            .and_then(|record| record.result.as_ref())
            .or_else(|| self.echoes.get(stamp).and_then(|echo| echo.result.as_ref()))
    }

    fn children_of(&self, parent: &Stamp) -> &[Stamp] {
        self.records
            .get(parent)
            .map(|record| record.children.as_slice())
            .unwrap_or(&[])
    }

    /// Children of `parent` still holding up its sync.
    pub fn pending_children(&self, parent: &Stamp) -> Vec<Stamp> {
        self.children_of(parent)
            .iter()
            .filter(|child| {
                self.state_of(child)
                    .map(|state| !state.is_resolved())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// First child, in spawn order, that finished with an application error.
    pub fn failed_child(&self, parent: &Stamp) -> Option<(Stamp, String)> {
        self.children_of(parent).iter().find_map(|child| {
            if self.state_of(child) != Some(TaskState::Finished) {
                return None;
            }
            match self.child_result(child) {
                Some(TaskOutcome::Failed { error }) => Some((child.clone(), error.clone())),
                _ => None,
            }
        })
    }

    /// Non-destructive view of a child's outcome, if it is available yet.
    pub fn peek_child(&self, child: &Stamp) -> Option<ChildOutcome> {
        let child = &self.current(child);
        match self.state_of(child)? {
            TaskState::Aborted => Some(ChildOutcome::Aborted),
            TaskState::Finished | TaskState::Stored => match self.child_result(child)? {
                TaskOutcome::Value(value) => Some(ChildOutcome::Finished(value.clone())),
                TaskOutcome::Failed { .. } => None,
            },
            _ => None,
        }
    }

    /// Removes every resolved child of `parent` and returns their outcomes in
    /// spawn order, under the stamps `spawn` handed out.
    pub fn collect_children(&mut self, parent: &Stamp) -> Vec<Collected> {
        let children = match self.records.get(parent) {
            Some(record) => record.children.clone(),
            None => return Vec::new(),
        };

        let mut collected = Vec::new();
        let mut remaining = Vec::new();
        for child in children {
            let resolved = self
                .state_of(&child)
                .map(|state| state.is_resolved())
                .unwrap_or(true);
            if !resolved {
                remaining.push(child);
                continue;
            }

            let (state, result) = match self.records.remove(&child) {
                Some(record) => (Some(record.state), record.result),
                None => match self.echoes.remove(&child) {
                    Some(echo) => (Some(echo.state), echo.result),
                    None => (None, None),
                },
            };
            let outcome = match state {
                Some(TaskState::Finished) | Some(TaskState::Stored) => result,
                _ => None,
            };
            let handle = self.handles.remove(&child).unwrap_or(child);
            collected.push((handle, outcome));
        }

        if let Some(record) = self.records.get_mut(parent) {
            record.children = remaining;
        }
        collected
    }

    /// Drops whatever is left of `parent`'s children once its frame exits.
    pub fn reclaim_children(&mut self, parent: &Stamp) -> usize {
        let children = match self.records.get_mut(parent) {
            Some(record) => std::mem::take(&mut record.children),
            None => return 0,
        };
        let mut reclaimed = 0;
        for child in children {
            self.handles.remove(&child);
            if self.records.remove(&child).is_some() || self.echoes.remove(&child).is_some() {
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            let records = &self.records;
            self.ready.retain(|stamp| records.contains_key(stamp));
        }
        reclaimed
    }

    /// The Global Result Table entry describing `stamp` with `outcome`.
    pub fn grt_entry(&self, stamp: &Stamp, outcome: TaskOutcome) -> Option<GrtEntry> {
        self.records.get(stamp).map(|record| {
            GrtEntry::result(
                record.identity().clone(),
                record.parent_key.clone(),
                record.spawn_index,
                outcome,
                self.local.clone(),
            )
        })
    }

    /// True for records stolen from another worker: their result travels back
    /// over the network.
    pub fn reports_remotely(&self, stamp: &Stamp) -> bool {
        self.records
            .get(stamp)
            .map(|record| record.parent.is_some() && record.spawner != self.local)
            .unwrap_or(false)
    }

    /// Finishes a running record. `None` means the task was aborted.
    pub fn complete(&mut self, stamp: &Stamp, outcome: Option<TaskOutcome>) -> Completion {
        let Some(record) = self.records.get_mut(stamp) else {
            return Completion::Discarded;
        };

        let outcome = match outcome {
            Some(outcome) if record.state != TaskState::Aborted => outcome,
            _ => {
                record.transition(TaskState::Aborted);
                record.result = None;
                // A local parent still collects the aborted child.
                if record.parent.is_none() || record.spawner != self.local {
                    self.records.remove(stamp);
                }
                return Completion::Discarded;
            }
        };

        record.transition(TaskState::Finished);
        if record.parent.is_none() {
            self.records.remove(stamp);
            return Completion::Root(outcome);
        }
        if record.spawner != self.local {
            let to = record.spawner.clone();
            self.records.remove(stamp);
            return Completion::Report {
                to,
                stamp: stamp.clone(),
                outcome,
            };
        }
        record.result = Some(outcome);
        Completion::Local
    }

    /// Fills the echo of a stolen child with the thief's result. Returns
    /// false when the echo is gone or already resolved.
    pub fn record_remote_result(&mut self, stamp: &Stamp, outcome: TaskOutcome) -> bool {
        match self.echoes.get_mut(stamp) {
            Some(echo) if echo.state == TaskState::Stolen => {
                echo.state = TaskState::Finished;
                echo.result = Some(outcome);
                true
            }
            _ => false,
        }
    }

    /// Aborts `target` and everything below it. Running records notice at
    /// their next checkpoint; stolen ones need the returned forwards.
    pub fn kill_subtree(&mut self, target: &Stamp) -> KillReport {
        let target = &self.current(target);
        let mut report = KillReport::default();

        for record in self.records.values_mut() {
            if !record.is_in_subtree_of(target) {
                continue;
            }
            if record.transition(TaskState::Aborted) {
                record.result = None;
                report.aborted += 1;
            }
        }
        let records = &self.records;
        self.ready.retain(|stamp| {
            records
                .get(stamp)
                .map(|record| record.state == TaskState::Spawned)
                .unwrap_or(false)
        });

        for echo in self.echoes.values_mut() {
            if !echo.is_in_subtree_of(target) || !echo.state.can_become(TaskState::Aborted) {
                continue;
            }
            let was_stolen = echo.state == TaskState::Stolen;
            echo.state = TaskState::Aborted;
            echo.result = None;
            report.aborted += 1;
            if was_stolen {
                report.forwards.push(AbortForward {
                    to: echo.thief.clone(),
                    stamp: echo.stamp.clone(),
                });
            }
        }
        report
    }

    /// Stamps of echoes still waiting on `thief`.
    pub fn echoes_stolen_by(&self, thief: &WorkerId) -> Vec<Stamp> {
        let mut stamps: Vec<Stamp> = self
            .echoes
            .values()
            .filter(|echo| &echo.thief == thief && echo.state == TaskState::Stolen)
            .map(|echo| echo.stamp.clone())
            .collect();
        stamps.sort();
        stamps
    }

    /// Records this worker stole from `spawner` and still holds.
    pub fn stolen_from(&self, spawner: &WorkerId) -> Vec<Stamp> {
        let mut stamps: Vec<Stamp> = self
            .records
            .values()
            .filter(|record| &record.spawner == spawner && record.parent.is_some())
            .filter(|record| !record.state.is_terminal())
            .map(|record| record.stamp.clone())
            .collect();
        stamps.sort();
        stamps
    }

    /// Orphan markers for the unfinished records of `root`'s subtree.
    /// Finished records in the subtree are moved to `Stored`: their results
    /// are already in the table.
    pub fn orphan_subtree(&mut self, root: &Stamp) -> Vec<GrtEntry> {
        let mut markers = Vec::new();
        for record in self.records.values_mut() {
            if !record.is_in_subtree_of(root) {
                continue;
            }
            match record.state {
                TaskState::Finished => {
                    record.transition(TaskState::Stored);
                }
                TaskState::Spawned | TaskState::Running | TaskState::Stolen => {
                    markers.push(GrtEntry::orphan(
                        record.identity().clone(),
                        record.parent_key.clone(),
                        record.spawn_index,
                        self.local.clone(),
                    ));
                }
                TaskState::Aborted | TaskState::Stored => {}
            }
        }
        for echo in self.echoes.values() {
            if echo.is_in_subtree_of(root) && echo.state == TaskState::Stolen {
                markers.push(GrtEntry::orphan(
                    echo.identity().clone(),
                    echo.parent_key.clone(),
                    echo.spawn_index,
                    self.local.clone(),
                ));
            }
        }
        markers
    }

    /// Resolves the echo of a task lost with its thief using a known result.
    pub fn adopt(&mut self, stamp: &Stamp, outcome: TaskOutcome) -> bool {
        self.record_remote_result(stamp, outcome)
    }

    /// Replaces the echo of a task lost with its thief by a fresh record that
    /// re-executes it. The parent's child list points at the new stamp.
    pub fn respawn(&mut self, stamp: &Stamp) -> Option<Stamp> {
        let echo = self.echoes.get(stamp)?;
        if echo.state != TaskState::Stolen {
            return None;
        }
        let echo = self.echoes.remove(stamp)?;
        let identity = echo.identity().clone();
        let parent = echo.parent.clone();

        let fresh = self.next_stamp();
        let handle = self.handles.remove(stamp).unwrap_or_else(|| stamp.clone());
        self.handles.insert(fresh.clone(), handle);
        let mut record = self.record_from_echo(echo, fresh.clone());
        record.redo_of = Some(identity);
        self.records.insert(fresh.clone(), record);

        if let Some(parent) = parent {
            if let Some(parent) = self.records.get_mut(&parent) {
                for child in parent.children.iter_mut() {
                    if child == stamp {
                        *child = fresh.clone();
                    }
                }
            }
        }
        self.ready.push_back(fresh.clone());
        Some(fresh)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn echo_count(&self) -> usize {
        self.echoes.len()
    }
}
