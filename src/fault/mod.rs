//! Fault Tolerance Module
//!
//! Keeps finished work from being lost when a worker dies mid-computation.
//!
//! ## Overview
//! - Every task that finishes writes its result into the **Global Result
//!   Table** before the result is reported. Results that travel between
//!   workers, and orphan markers, are replicated to every live member before
//!   the report leaves.
//! - The **Fault Monitor** consumes the registry's membership events. On a
//!   death it aborts subtrees that lost their parent and resolves or
//!   re-spawns the tasks the dead worker had stolen.
//!
//! ## Submodules
//! - **`grt`**: the replicated result table.
//! - **`monitor`**: membership-event handling and crash recovery.

pub mod grt;
pub mod monitor;
