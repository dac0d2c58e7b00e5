//! Job Registry
//!
//! Maps job names (e.g. "fib") to the Rust closures that implement them. A
//! spawn carries only the name and JSON arguments, so any worker holding the
//! same registry can run any stolen task.
//!
//! A job may also carry a guard: a predicate over the local shared-object
//! replicas that must hold before a stolen instance of the job may run.

use super::context::TaskContext;
use super::types::Invocation;
use crate::error::EngineError;
use crate::shared::replicator::Replicator;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// A registered job. Runs on the executor thread and may block in `sync`.
pub type JobFn = Arc<dyn Fn(&mut TaskContext<'_>, Value) -> Result<Value> + Send + Sync>;

pub type GuardFn = Arc<dyn Fn(&Arc<Replicator>, &Value) -> bool + Send + Sync>;

/// Replica freshness a job needs before it runs on a thief.
#[derive(Clone)]
pub struct JobGuard {
    /// Objects fetched from the job's spawner, in order, while the guard fails.
    pub objects: Vec<String>,
    check: GuardFn,
}

impl JobGuard {
    pub fn is_satisfied(&self, replicator: &Arc<Replicator>, args: &Value) -> bool {
        (self.check)(replicator, args)
    }
}

pub struct JobRegistry {
    jobs: DashMap<String, JobFn>,
    guards: DashMap<String, JobGuard>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `job` under `name`, replacing any previous registration.
    pub fn register<F>(&self, name: &str, job: F)
    where
        F: Fn(&mut TaskContext<'_>, Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.jobs.insert(name.to_string(), Arc::new(job));
        tracing::info!("Registered job: {}", name);
    }

    /// Attaches a guard to `name`. `check` sees the local replicas and the
    /// job's arguments.
    pub fn register_guard<F>(&self, name: &str, objects: &[&str], check: F)
    where
        F: Fn(&Arc<Replicator>, &Value) -> bool + Send + Sync + 'static,
    {
        self.guards.insert(
            name.to_string(),
            JobGuard {
                objects: objects.iter().map(|id| id.to_string()).collect(),
                check: Arc::new(check),
            },
        );
        tracing::info!("Registered guard for job: {}", name);
    }

    pub fn guard(&self, name: &str) -> Option<JobGuard> {
        self.guards.get(name).map(|entry| entry.value().clone())
    }

    /// Runs the job named by `invocation` in `ctx`.
    ///
    /// # Returns
    /// * `Ok(value)` when the job completed.
    /// * `Err` when the job failed, was aborted, or is not registered.
    pub fn execute(&self, invocation: &Invocation, ctx: &mut TaskContext<'_>) -> Result<Value> {
        // Release the map shard before running: jobs may take a long time.
        let job = self
            .jobs
            .get(&invocation.job)
            .map(|entry| entry.value().clone());

        match job {
            Some(job) => {
                tracing::trace!("Running job '{}' as {}", invocation.job, ctx.stamp());
                job(ctx, invocation.args.clone())
            }
            None => {
                tracing::error!("Unknown job: {}", invocation.job);
                Err(EngineError::UnknownJob(invocation.job.clone()).into())
            }
        }
    }

    pub fn list_jobs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self {
            jobs: DashMap::new(),
            guards: DashMap::new(),
        }
    }
}
