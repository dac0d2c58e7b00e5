//! Worker
//!
//! One worker per process (or per simulated node). It owns the Task Stack
//! and runs two loops against it:
//! 1. **Executor** (blocking thread): runs the root or idles, executes tasks
//!    depth-first, and steals from peers when local work runs out.
//! 2. **Message pump** (async task): serves steal requests, records results
//!    and aborts, applies shared-object and Global Result Table updates, and
//!    hands membership events to the fault monitor.
//!
//! Both meet at one mutex-guarded `WorkerState`. The condvar wakes the
//! executor whenever something it may be waiting on changes.

use super::context::TaskContext;
use super::jobs::JobRegistry;
use super::stack::{AbortForward, Completion, ReadyTask, TaskStack};
use super::stats::{bump, StatsSnapshot, WorkerStats};
use super::steal::{StealBackoff, VictimSelector};
use super::types::{ChildOutcome, Invocation, ShippedTask, Stamp, TaskOutcome, WorkerId};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::fault::grt::{GlobalResultTable, GrtValue};
use crate::fault::monitor::FaultMonitor;
use crate::membership::registry::Registry;
use crate::membership::types::MembershipEvent;
use crate::shared::replicator::Replicator;
use crate::transport::protocol::{Envelope, Message};
use crate::transport::{Inbox, Transport};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

/// The single outstanding steal request of this worker.
#[derive(Default)]
pub(crate) struct StealSlot {
    victim: Option<WorkerId>,
    /// `Some(None)`: the victim had nothing.
    reply: Option<Option<Stamp>>,
    victim_crashed: bool,
    /// Stolen tasks whose reply came after the thief stopped waiting.
    late_jobs: VecDeque<Stamp>,
}

pub(crate) struct WorkerState {
    pub(crate) stack: TaskStack,
    steal: StealSlot,
    pub(crate) exiting: bool,
    pub(crate) root_lost: Option<WorkerId>,
}

impl WorkerState {
    /// Gives up on an in-flight steal from `dead`.
    pub(crate) fn victim_crashed(&mut self, dead: &WorkerId) -> bool {
        if self.steal.victim.as_ref() == Some(dead) {
            self.steal.victim_crashed = true;
            return true;
        }
        false
    }

    fn next_job(&mut self) -> Option<ReadyTask> {
        while let Some(stamp) = self.steal.late_jobs.pop_front() {
            if let Some(ready) = self.stack.claim_stolen(&stamp) {
                return Some(ready);
            }
        }
        self.stack.pop_newest()
    }
}

pub struct Worker {
    id: WorkerId,
    master: WorkerId,
    selector: VictimSelector,
    backoff: StealBackoff,
    config: EngineConfig,
    state: Mutex<WorkerState>,
    wakeup: Condvar,
    jobs: Arc<JobRegistry>,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    grt: Arc<GlobalResultTable>,
    replicator: Arc<Replicator>,
    stats: Arc<WorkerStats>,
    /// Taken by the message pump on start.
    events: Mutex<Option<broadcast::Receiver<MembershipEvent>>>,
}

impl Worker {
    /// `master` is the worker that runs the root task.
    pub fn new(
        config: EngineConfig,
        master: WorkerId,
        jobs: Arc<JobRegistry>,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
    ) -> Arc<Self> {
        let id = transport.local_id().clone();
        let stats = Arc::new(WorkerStats::default());
        let replicator = Replicator::new(
            transport.clone(),
            registry.clone(),
            config.so_batch_size,
            stats.clone(),
        );
        // Subscribe now so no death between construction and start is missed.
        let events = registry.subscribe();

        Arc::new(Self {
            id: id.clone(),
            master,
            selector: VictimSelector::new(config.victim_policy),
            backoff: StealBackoff::new(&config),
            config,
            state: Mutex::new(WorkerState {
                stack: TaskStack::new(id),
                steal: StealSlot::default(),
                exiting: false,
                root_lost: None,
            }),
            wakeup: Condvar::new(),
            jobs,
            transport,
            registry,
            grt: GlobalResultTable::new(),
            replicator,
            stats,
            events: Mutex::new(Some(events)),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn master(&self) -> &WorkerId {
        &self.master
    }

    pub fn is_master(&self) -> bool {
        self.id == self.master
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    pub fn grt(&self) -> &Arc<GlobalResultTable> {
        &self.grt
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_exiting(&self) -> bool {
        self.state.lock().exiting
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock()
    }

    pub(crate) fn notify(&self) {
        self.wakeup.notify_all();
    }

    fn peers(&self) -> Vec<WorkerId> {
        self.registry
            .current_members()
            .into_iter()
            .map(|m| m.id)
            .filter(|id| id != &self.id)
            .collect()
    }

    // --- Lifecycle ---

    /// Starts the message pump on the current runtime.
    pub fn start(self: &Arc<Self>, mut inbox: Inbox) -> JoinHandle<()> {
        let worker = self.clone();
        let mut events = self.events.lock().take();

        tokio::spawn(async move {
            let monitor = FaultMonitor::new(worker.clone());
            loop {
                // Inbox first: everything a peer sent before dying is handled
                // before its death.
                tokio::select! {
                    biased;
                    envelope = inbox.recv() => match envelope {
                        Some(envelope) => worker.handle_envelope(envelope),
                        None => break,
                    },
                    event = next_event(&mut events) => match event {
                        Ok(event) => monitor.handle_event(event),
                        Err(RecvError::Lagged(missed)) => {
                            tracing::warn!("{} missed {} membership events", worker.id, missed)
                        }
                        Err(RecvError::Closed) => events = None,
                    },
                }
            }
            tracing::debug!("Message pump of {} stopped", worker.id);
            worker.halt();
        })
    }

    /// Runs `invocation` as the root on a blocking thread, then tells every
    /// other worker to exit.
    pub fn spawn_root(
        self: &Arc<Self>,
        invocation: Invocation,
    ) -> JoinHandle<Result<Value, EngineError>> {
        let worker = self.clone();
        tokio::task::spawn_blocking(move || {
            let result = worker.run_root(invocation);
            worker.shutdown_cluster();
            result
        })
    }

    pub fn spawn_idle_loop(self: &Arc<Self>) -> JoinHandle<Result<(), EngineError>> {
        let worker = self.clone();
        tokio::task::spawn_blocking(move || worker.run_idle_loop())
    }

    pub fn run_root(&self, invocation: Invocation) -> Result<Value, EngineError> {
        let stamp = self.state.lock().stack.start_root(invocation.clone());
        tracing::info!("Root task {} started: {}", stamp, invocation.job);
        bump(&self.stats.tasks_run);

        let outcome = self.run_frame(&stamp, &invocation);
        match self.finish(&stamp, outcome) {
            Completion::Root(TaskOutcome::Value(value)) => {
                tracing::info!("Root task {} finished", stamp);
                Ok(value)
            }
            Completion::Root(TaskOutcome::Failed { error }) => {
                Err(EngineError::TaskFailed { stamp, error })
            }
            _ => Err(EngineError::Aborted(stamp)),
        }
    }

    /// Executes stolen work until `Exit` arrives or the root is lost.
    pub fn run_idle_loop(&self) -> Result<(), EngineError> {
        tracing::info!("Worker {} waiting for work", self.id);
        let result = loop {
            let next = {
                let mut state = self.state.lock();
                if let Some(master) = state.root_lost.clone() {
                    break Err(EngineError::RootLost(master));
                }
                if state.exiting {
                    break Ok(());
                }
                state.next_job()
            };
            match next {
                Some(ready) => self.run_ready(ready),
                None => self.idle_round(None),
            }
        };

        self.replicator.flush();
        self.stats.log_summary(&self.id);
        result
    }

    /// Flushes pending broadcasts, sends `Exit` to every peer and stops.
    pub fn shutdown_cluster(&self) {
        self.replicator.flush();
        self.flush_grt();
        let delivered = self.transport.broadcast(&self.peers(), Message::Exit);
        tracing::info!("Exit sent to {} workers", delivered);
        self.halt();
        self.stats.log_summary(&self.id);
    }

    pub fn halt(&self) {
        self.state.lock().exiting = true;
        self.wakeup.notify_all();
    }

    // --- Task execution ---

    fn run_ready(&self, ready: ReadyTask) {
        if self.config.fault_tolerance {
            let known = ready
                .redo_of
                .as_ref()
                .and_then(|identity| self.grt.lookup_result(identity));
            if let Some(outcome) = known {
                bump(&self.stats.grt_adoptions);
                tracing::debug!("{} adopts a stored result instead of re-running", ready.stamp);
                self.finish(&ready.stamp, Some(outcome));
                return;
            }
        }

        if let Some(source) = &ready.source {
            if !self.satisfy_guard(source, &ready.invocation) {
                tracing::info!("{} dropped: {} left before its guard held", ready.stamp, source);
                self.finish(&ready.stamp, None);
                return;
            }
        }

        bump(&self.stats.tasks_run);
        let outcome = self.run_frame(&ready.stamp, &ready.invocation);
        self.finish(&ready.stamp, outcome);
    }

    /// Brings the replicas a stolen job's guard reads up to date, fetching
    /// them from `source` in order until the guard holds. Returns false only
    /// when `source` died, since then nobody awaits the result.
    fn satisfy_guard(&self, source: &WorkerId, invocation: &Invocation) -> bool {
        let Some(guard) = self.jobs.guard(&invocation.job) else {
            return true;
        };
        if guard.is_satisfied(&self.replicator, &invocation.args) {
            return true;
        }
        bump(&self.stats.guard_misses);
        tracing::debug!("Guard of {} fails locally, fetching from {}", invocation.job, source);

        for object_id in &guard.objects {
            match self
                .replicator
                .fetch_state(source, object_id, self.config.guard_fetch_timeout())
            {
                Ok(true) => {
                    if guard.is_satisfied(&self.replicator, &invocation.args) {
                        return true;
                    }
                }
                Ok(false) => {
                    if !self.registry.is_alive(source) {
                        return false;
                    }
                    tracing::debug!("Transfer of '{}' from {} timed out", object_id, source);
                }
                Err(e) => {
                    tracing::debug!("Fetching '{}' from {} failed: {}", object_id, source, e);
                    if !self.registry.is_alive(source) {
                        return false;
                    }
                }
            }
        }

        tracing::warn!("Guard of {} still fails after fetching, running anyway", invocation.job);
        true
    }

    /// Runs one task frame. `None` means the task was aborted.
    fn run_frame(&self, stamp: &Stamp, invocation: &Invocation) -> Option<TaskOutcome> {
        let mut ctx = TaskContext::new(self, stamp.clone());
        let result = match self.jobs.execute(invocation, &mut ctx) {
            // Implicit sync: children never outlive their parent's frame.
            Ok(value) => ctx.sync().map(|()| value).map_err(anyhow::Error::from),
            Err(e) => {
                ctx.abort_all();
                Err(e)
            }
        };
        drop(ctx);
        self.state.lock().stack.reclaim_children(stamp);

        match result {
            Ok(value) => {
                bump(&self.stats.tasks_finished);
                Some(TaskOutcome::Value(value))
            }
            Err(e) if EngineError::is_abort(&e) || self.is_aborted(stamp) => None,
            Err(e) => {
                tracing::debug!("Task {} failed: {:#}", stamp, e);
                Some(TaskOutcome::Failed {
                    error: format!("{:#}", e),
                })
            }
        }
    }

    /// Stores and routes the result of a finished frame.
    fn finish(&self, stamp: &Stamp, outcome: Option<TaskOutcome>) -> Completion {
        let mut state = self.state.lock();

        if self.config.fault_tolerance && !state.stack.is_aborted(stamp) {
            if let Some(outcome) = &outcome {
                let remote = state.stack.reports_remotely(stamp);
                let entry = state
                    .stack
                    .grt_entry(stamp, outcome.clone())
                    .filter(|entry| entry.parent.is_some());
                if let Some(entry) = entry {
                    let stored = if remote {
                        self.grt.store(entry)
                    } else {
                        self.grt.store_local(entry)
                    };
                    if stored {
                        bump(&self.stats.grt_stores);
                    }
                }
            }
        }

        let completion = state.stack.complete(stamp, outcome);
        match &completion {
            Completion::Report { to, stamp, outcome } => {
                // The table update must leave before the result does.
                self.flush_grt();
                let message = Message::JobResult {
                    stamp: stamp.clone(),
                    outcome: outcome.clone(),
                };
                if let Err(e) = self.transport.send(to, message) {
                    tracing::warn!("Result of {} could not reach {}: {}", stamp, to, e);
                }
            }
            Completion::Discarded => {
                bump(&self.stats.results_discarded);
                tracing::trace!("Result of aborted task {} discarded", stamp);
            }
            Completion::Local | Completion::Root(_) => {}
        }
        completion
    }

    pub(crate) fn spawn_child(
        &self,
        parent: &Stamp,
        invocation: Invocation,
    ) -> Result<Stamp, EngineError> {
        let mut state = self.state.lock();
        if state.exiting {
            return Err(EngineError::Shutdown);
        }
        if state.stack.is_aborted(parent) {
            return Err(EngineError::Aborted(parent.clone()));
        }
        let (index, redo_of) = state
            .stack
            .next_child_slot(parent)
            .ok_or_else(|| EngineError::UnknownTask(parent.clone()))?;

        // A re-executed parent picks up what its previous life left behind.
        let known = match redo_of {
            Some(identity) if self.config.fault_tolerance => self.grt.lookup_child(&identity, index),
            _ => None,
        };
        let stamp = match known {
            Some(entry) => match entry.value {
                GrtValue::Result(outcome) => {
                    bump(&self.stats.grt_adoptions);
                    state
                        .stack
                        .spawn_finished(parent, invocation, Some(entry.key), outcome)?
                }
                GrtValue::Orphan => state.stack.spawn(parent, invocation, Some(entry.key))?,
            },
            None => state.stack.spawn(parent, invocation, None)?,
        };

        bump(&self.stats.spawns);
        tracing::trace!("{} spawned {}", parent, stamp);
        Ok(stamp)
    }

    pub(crate) fn sync_children(
        &self,
        stamp: &Stamp,
    ) -> Result<Vec<(Stamp, ChildOutcome)>, EngineError> {
        let mut failure: Option<(Stamp, String)> = None;

        loop {
            let next = {
                let mut state = self.state.lock();
                if state.stack.is_aborted(stamp) {
                    return Err(EngineError::Aborted(stamp.clone()));
                }
                if state.exiting {
                    return Err(EngineError::Shutdown);
                }

                if failure.is_none() {
                    if let Some((child, error)) = state.stack.failed_child(stamp) {
                        tracing::debug!("Child {} of {} failed, aborting siblings", child, stamp);
                        for sibling in state.stack.pending_children(stamp) {
                            let report = state.stack.kill_subtree(&sibling);
                            self.send_forwards(&report.forwards);
                        }
                        failure = Some((child, error));
                    }
                }

                if state.stack.pending_children(stamp).is_empty() {
                    let collected = state.stack.collect_children(stamp);
                    drop(state);
                    if let Some((child, error)) = failure {
                        return Err(EngineError::TaskFailed {
                            stamp: child,
                            error,
                        });
                    }
                    return Ok(collected
                        .into_iter()
                        .map(|(child, outcome)| match outcome {
                            Some(TaskOutcome::Value(value)) => (child, ChildOutcome::Finished(value)),
                            _ => (child, ChildOutcome::Aborted),
                        })
                        .collect());
                }

                state.next_job()
            };

            match next {
                Some(ready) => self.run_ready(ready),
                None => self.idle_round(Some(stamp)),
            }
        }
    }

    pub(crate) fn peek_child(&self, child: &Stamp) -> Option<ChildOutcome> {
        self.state.lock().stack.peek_child(child)
    }

    pub(crate) fn is_aborted(&self, stamp: &Stamp) -> bool {
        self.state.lock().stack.is_aborted(stamp)
    }

    // --- Aborts ---

    /// Aborts `target` and its subtree. Stolen parts are chased to their thieves.
    pub fn abort_task(&self, target: &Stamp) -> usize {
        let aborted = {
            let mut state = self.state.lock();
            let report = state.stack.kill_subtree(target);
            self.send_forwards(&report.forwards);
            report.aborted
        };
        if aborted == 0 {
            tracing::debug!("Abort of {} matched nothing on {}", target, self.id);
        }
        self.wakeup.notify_all();
        aborted
    }

    pub(crate) fn abort_children(&self, parent: &Stamp) {
        {
            let mut state = self.state.lock();
            for child in state.stack.pending_children(parent) {
                let report = state.stack.kill_subtree(&child);
                self.send_forwards(&report.forwards);
            }
        }
        self.wakeup.notify_all();
    }

    /// Sent while the state lock is held so forwards stay behind the steal
    /// reply that shipped the task.
    pub(crate) fn send_forwards(&self, forwards: &[AbortForward]) {
        for forward in forwards {
            let message = Message::Abort {
                stamp: forward.stamp.clone(),
            };
            if let Err(e) = self.transport.send(&forward.to, message) {
                tracing::debug!("Abort of {} not forwarded to {}: {}", forward.stamp, forward.to, e);
            }
        }
    }

    // --- Stealing ---

    /// One idle step: steal and run, or back off until woken.
    fn idle_round(&self, waiting_for: Option<&Stamp>) {
        self.replicator.flush();
        self.flush_grt();

        if let Some(stamp) = self.try_steal() {
            self.backoff.reset();
            let ready = self.state.lock().stack.claim_stolen(&stamp);
            if let Some(ready) = ready {
                self.run_ready(ready);
            }
            return;
        }

        let delay = self.backoff.next_delay();
        let mut state = self.state.lock();
        if state.exiting || state.root_lost.is_some() {
            return;
        }
        if !state.steal.late_jobs.is_empty() || state.stack.ready_len() > 0 {
            return;
        }
        if let Some(stamp) = waiting_for {
            if state.stack.is_aborted(stamp) || state.stack.pending_children(stamp).is_empty() {
                return;
            }
        }
        self.wakeup.wait_for(&mut state, delay);
    }

    fn try_steal(&self) -> Option<Stamp> {
        let members = self.registry.current_members();
        let candidates =
            self.selector
                .candidates(&self.id, &members, self.config.max_steal_attempts);

        for victim in candidates {
            bump(&self.stats.steal_attempts);
            if let Some(stamp) = self.steal_from(&victim) {
                bump(&self.stats.steals_succeeded);
                tracing::debug!("{} stole {} from {}", self.id, stamp, victim);
                return Some(stamp);
            }
            if self.is_exiting() {
                break;
            }
        }
        None
    }

    /// Sends a steal request and waits for the reply, the victim's death, or
    /// the timeout, whichever comes first.
    fn steal_from(&self, victim: &WorkerId) -> Option<Stamp> {
        let mut state = self.state.lock();
        if state.exiting {
            return None;
        }
        state.steal.victim = Some(victim.clone());
        state.steal.reply = None;
        state.steal.victim_crashed = false;

        if let Err(e) = self.transport.send(victim, Message::StealRequest) {
            tracing::debug!("Steal request to {} failed: {}", victim, e);
            state.steal.victim = None;
            return None;
        }

        let deadline = Instant::now() + self.config.steal_wait_timeout();
        loop {
            if let Some(reply) = state.steal.reply.take() {
                return reply;
            }
            if state.steal.victim_crashed || state.exiting {
                state.steal.victim = None;
                return None;
            }
            if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                if let Some(reply) = state.steal.reply.take() {
                    return reply;
                }
                state.steal.victim = None;
                bump(&self.stats.steal_timeouts);
                tracing::debug!("Steal request to {} timed out", victim);
                return None;
            }
        }
    }

    // --- Message pump ---

    pub fn handle_envelope(&self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
            Message::StealRequest => self.serve_steal(&from),
            Message::StealReply { task } => self.accept_reply(&from, task),
            Message::JobResult { stamp, outcome } => self.accept_result(&stamp, outcome),
            Message::Abort { stamp } => {
                bump(&self.stats.aborts_handled);
                self.abort_task(&stamp);
            }
            Message::SoBatch { invocations } => {
                self.replicator.handle_batch(&from, invocations);
            }
            Message::SoRequest { object_id } => self.replicator.handle_request(&from, &object_id),
            Message::SoTransfer { object_id, state } => {
                self.replicator.handle_transfer(&object_id, state)
            }
            Message::GrtUpdate { entries } => {
                let merged = self.grt.merge(entries);
                tracing::trace!("Merged {} table entries from {}", merged, from);
            }
            Message::Exit => {
                tracing::info!("Worker {} received exit from {}", self.id, from);
                self.halt();
            }
            Message::Undelivered { to, message } => self.handle_undelivered(&to, *message),
        }
    }

    /// Recovers from a message the transport gave up on. A lost steal reply
    /// puts the task back; a lost result means its parent is out of reach,
    /// which recovery treats as a death.
    fn handle_undelivered(&self, to: &WorkerId, message: Message) {
        match message {
            Message::StealReply { task: Some(task) } => {
                let restored = self.state.lock().stack.unsteal(&task.stamp);
                if restored {
                    tracing::warn!("Steal reply for {} never reached {}, task restored", task.stamp, to);
                    self.wakeup.notify_all();
                }
            }
            Message::JobResult { stamp, .. } => {
                tracing::warn!("Result of {} never reached {}, declaring it dead", stamp, to);
                self.registry.report_unreachable(to);
            }
            other => {
                tracing::debug!("{} to {} undelivered", other.kind(), to);
            }
        }
    }

    fn serve_steal(&self, thief: &WorkerId) {
        let mut state = self.state.lock();
        let task = if state.exiting {
            None
        } else {
            state.stack.steal_oldest(thief)
        };
        let stamp = task.as_ref().map(|task| task.stamp.clone());

        if let Err(e) = self.transport.send(thief, Message::StealReply { task }) {
            tracing::warn!("Steal reply to {} failed: {}", thief, e);
            if let Some(stamp) = stamp {
                state.stack.unsteal(&stamp);
            }
            return;
        }
        if let Some(stamp) = stamp {
            bump(&self.stats.steals_served);
            tracing::debug!("{} stolen by {}", stamp, thief);
        }
    }

    fn accept_reply(&self, from: &WorkerId, task: Option<ShippedTask>) {
        {
            let mut state = self.state.lock();
            let stamp = match task {
                Some(task) => {
                    let offered = task.stamp.clone();
                    match state.stack.accept_stolen(task) {
                        Some(stamp) => Some(stamp),
                        None => {
                            tracing::debug!("Duplicate steal reply for {} from {} ignored", offered, from);
                            return;
                        }
                    }
                }
                None => None,
            };
            if state.steal.victim.as_ref() == Some(from) {
                state.steal.victim = None;
                state.steal.reply = Some(stamp);
            } else if let Some(stamp) = stamp {
                tracing::warn!("Late steal reply from {}: {} queued", from, stamp);
                state.steal.late_jobs.push_back(stamp);
            }
        }
        self.wakeup.notify_all();
    }

    fn accept_result(&self, stamp: &Stamp, outcome: TaskOutcome) {
        let accepted = self.state.lock().stack.record_remote_result(stamp, outcome);
        if accepted {
            self.wakeup.notify_all();
        } else {
            bump(&self.stats.results_discarded);
            tracing::debug!("Result for {} ignored: aborted or unknown", stamp);
        }
    }

    /// Broadcasts table entries queued by local inserts. Concurrent callers
    /// serialize on the outbox, so a result report sent after this returns
    /// always trails the entries queued before it.
    pub(crate) fn flush_grt(&self) -> usize {
        let peers = self.peers();
        self.grt.flush_with(|entries| {
            tracing::trace!("Broadcasting {} table entries", entries.len());
            self.transport.broadcast(&peers, Message::GrtUpdate { entries });
        })
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<MembershipEvent>>,
) -> Result<MembershipEvent, RecvError> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
