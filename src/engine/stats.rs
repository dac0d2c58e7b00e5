//! Per-worker counters.

use super::types::WorkerId;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub spawns: AtomicU64,
    /// Tasks started by this worker, local or stolen.
    pub tasks_run: AtomicU64,
    /// Tasks whose result was produced (not aborted) on this worker.
    pub tasks_finished: AtomicU64,
    pub steal_attempts: AtomicU64,
    pub steals_succeeded: AtomicU64,
    pub steal_timeouts: AtomicU64,
    pub steals_served: AtomicU64,
    pub aborts_handled: AtomicU64,
    pub results_discarded: AtomicU64,
    pub grt_stores: AtomicU64,
    pub grt_adoptions: AtomicU64,
    pub respawns: AtomicU64,
    pub so_writes: AtomicU64,
    pub so_applies: AtomicU64,
    /// Stolen jobs whose guard failed against the local replicas.
    pub guard_misses: AtomicU64,
    pub so_fetches: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub spawns: u64,
    pub tasks_run: u64,
    pub tasks_finished: u64,
    pub steal_attempts: u64,
    pub steals_succeeded: u64,
    pub steal_timeouts: u64,
    pub steals_served: u64,
    pub aborts_handled: u64,
    pub results_discarded: u64,
    pub grt_stores: u64,
    pub grt_adoptions: u64,
    pub respawns: u64,
    pub so_writes: u64,
    pub so_applies: u64,
    pub guard_misses: u64,
    pub so_fetches: u64,
}

pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            spawns: get(&self.spawns),
            tasks_run: get(&self.tasks_run),
            tasks_finished: get(&self.tasks_finished),
            steal_attempts: get(&self.steal_attempts),
            steals_succeeded: get(&self.steals_succeeded),
            steal_timeouts: get(&self.steal_timeouts),
            steals_served: get(&self.steals_served),
            aborts_handled: get(&self.aborts_handled),
            results_discarded: get(&self.results_discarded),
            grt_stores: get(&self.grt_stores),
            grt_adoptions: get(&self.grt_adoptions),
            respawns: get(&self.respawns),
            so_writes: get(&self.so_writes),
            so_applies: get(&self.so_applies),
            guard_misses: get(&self.guard_misses),
            so_fetches: get(&self.so_fetches),
        }
    }

    pub fn log_summary(&self, worker: &WorkerId) {
        let s = self.snapshot();
        tracing::info!(
            "Worker {} stats: spawns={} run={} finished={} discarded={}",
            worker,
            s.spawns,
            s.tasks_run,
            s.tasks_finished,
            s.results_discarded
        );
        tracing::info!(
            "  steals: attempts={} succeeded={} timeouts={} served={}",
            s.steal_attempts,
            s.steals_succeeded,
            s.steal_timeouts,
            s.steals_served
        );
        tracing::info!(
            "  aborts={} grt: stores={} adoptions={} respawns={}",
            s.aborts_handled,
            s.grt_stores,
            s.grt_adoptions,
            s.respawns
        );
        tracing::info!(
            "  so: writes={} applies={} guard_misses={} fetches={}",
            s.so_writes,
            s.so_applies,
            s.guard_misses,
            s.so_fetches
        );
    }
}
