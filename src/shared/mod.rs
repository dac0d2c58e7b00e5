//! Shared Objects
//!
//! Replicated state that tasks on every worker can read locally and update
//! through broadcast writes. Independent of the task tree: writes neither
//! wait for nor order with steals, results or aborts.
//!
//! ## Submodules
//! - **`replicator`**: the `SharedState` trait, the per-worker replicator
//!   and typed `SharedObject` handles.

pub mod replicator;

#[cfg(test)]
mod tests;
