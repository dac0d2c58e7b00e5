//! Distributed Divide-and-Conquer Cluster Library
//!
//! Runs recursive spawn/sync computations across a cluster of workers by
//! random work stealing, with cooperative abort cascades, replicated shared
//! objects and crash recovery through a replicated result table.
//!
//! ## Architecture Modules
//! - **`engine`**: the task engine. Task Stack, executor loop, steal
//!   protocol, abort cascade and the API jobs are written against.
//! - **`shared`**: replicated shared objects with broadcast writes and
//!   local reads.
//! - **`fault`**: the Global Result Table and the monitor that recovers
//!   work lost with a dead worker.
//! - **`membership`**: who is alive. An in-process registry for simulated
//!   clusters and a UDP gossip service (SWIM-like) for real ones.
//! - **`transport`**: ordered point-to-point messaging, in-process or HTTP.
//! - **`apps`**: demo jobs (fib, tree sum, search with cut-off).

pub mod apps;
pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod membership;
pub mod shared;
pub mod transport;
