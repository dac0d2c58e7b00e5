//! Fault-Tolerance Monitor.
//!
//! Reacts to membership events. When a worker W disappears:
//! 1. An in-flight steal from W is abandoned.
//! 2. Subtrees this worker stole from W have nowhere to report: unfinished
//!    records get orphan markers in the Global Result Table, then the
//!    subtrees are aborted.
//! 3. Tasks W stole from this worker are resolved from the table when W (or
//!    a thief of W) stored their result, and re-spawned under a fresh stamp
//!    otherwise.
//!
//! Losing the master is fatal: nothing above the root can adopt it.

use crate::engine::stats::bump;
use crate::engine::types::WorkerId;
use crate::engine::worker::Worker;
use crate::membership::types::MembershipEvent;

use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub orphans_aborted: usize,
    pub orphan_markers: usize,
    pub adopted: usize,
    pub respawned: usize,
    pub root_lost: bool,
}

pub struct FaultMonitor {
    worker: Arc<Worker>,
}

impl FaultMonitor {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    pub fn handle_event(&self, event: MembershipEvent) {
        match event {
            MembershipEvent::Joined(id) => {
                tracing::debug!("Worker {} sees {} join", self.worker.id(), id);
            }
            MembershipEvent::Left(id) => {
                tracing::info!("Worker {} left", id);
                self.recover(&id);
            }
            MembershipEvent::Died(id) => {
                tracing::warn!("Worker {} died", id);
                let report = self.recover(&id);
                tracing::info!(
                    "Recovery on {} after {}: adopted={} respawned={} orphans_aborted={}",
                    self.worker.id(),
                    id,
                    report.adopted,
                    report.respawned,
                    report.orphans_aborted
                );
            }
        }
    }

    pub fn recover(&self, dead: &WorkerId) -> RecoveryReport {
        let worker = &self.worker;
        let mut report = RecoveryReport::default();
        if dead == worker.id() {
            return report;
        }

        let fault_tolerance = worker.config().fault_tolerance;
        {
            let mut state = worker.lock_state();
            state.victim_crashed(dead);

            if dead == worker.master() {
                tracing::error!("Master {} died, the root task is lost", dead);
                state.root_lost = Some(dead.clone());
                state.exiting = true;
                report.root_lost = true;
                drop(state);
                worker.notify();
                return report;
            }

            for root in state.stack.stolen_from(dead) {
                if fault_tolerance {
                    for marker in state.stack.orphan_subtree(&root) {
                        if worker.grt().store(marker) {
                            report.orphan_markers += 1;
                        }
                    }
                }
                let kill = state.stack.kill_subtree(&root);
                report.orphans_aborted += kill.aborted;
                worker.send_forwards(&kill.forwards);
            }

            for stamp in state.stack.echoes_stolen_by(dead) {
                let known = if fault_tolerance {
                    state
                        .stack
                        .echo(&stamp)
                        .and_then(|echo| worker.grt().lookup_result(echo.identity()))
                } else {
                    None
                };

                match known {
                    Some(outcome) => {
                        if state.stack.adopt(&stamp, outcome) {
                            report.adopted += 1;
                            bump(&worker.stats().grt_adoptions);
                            tracing::info!("{} adopted from the result table", stamp);
                        }
                    }
                    None => {
                        if let Some(fresh) = state.stack.respawn(&stamp) {
                            report.respawned += 1;
                            bump(&worker.stats().respawns);
                            tracing::info!("{} lost with {}, re-spawned as {}", stamp, dead, fresh);
                        }
                    }
                }
            }
        }

        if fault_tolerance {
            worker.flush_grt();
        }
        worker.notify();
        report
    }
}
