//! Divide-and-Conquer Task Engine
//!
//! Runs recursive spawn/sync computations across a cluster by random work
//! stealing.
//!
//! ## Architecture Overview
//! 1. **Spawn**: a running task creates child records on its worker's Task
//!    Stack. Children are not started until the parent syncs.
//! 2. **Local execution**: at sync the worker runs its newest ready record,
//!    depth-first, on the same thread.
//! 3. **Stealing**: a worker without local work asks a random peer for work.
//!    The victim hands over its oldest ready record and keeps an echo of it.
//! 4. **Results**: a stolen task's result travels back to the worker holding
//!    its parent and fills the echo.
//! 5. **Aborts**: aborting a task cancels its whole subtree. Local records
//!    are marked at once, and stolen ones are chased to their thieves.
//!    Running tasks see the abort at their next spawn or sync.
//!
//! ## Submodules
//! - **`types`**: stamps, task records, states and outcomes.
//! - **`stack`**: the per-worker Task Stack.
//! - **`jobs`**: registry of spawnable jobs.
//! - **`context`**: the API a running job uses.
//! - **`worker`**: executor loop, steal protocol and message dispatch.
//! - **`steal`**: victim selection and idle backoff.
//! - **`stats`**: per-worker counters.

pub mod context;
pub mod jobs;
pub mod stack;
pub mod stats;
pub mod steal;
pub mod types;
pub mod worker;
