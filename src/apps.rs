//! Demo divide-and-conquer jobs.
//!
//! - `fib`: naive doubly-recursive Fibonacci.
//! - `tree_sum`: full binary tree of a given depth. Each node returns its
//!   label plus its children's sums, so the root of depth `d` returns
//!   `1 + 2 + ... + (2^d - 1)`.
//! - `search`: finds an index holding `target` in a generated array. A hit
//!   is published through the `search.found` shared object, and subtrees
//!   spawned after that are aborted before they run.

use crate::engine::context::TaskContext;
use crate::engine::jobs::JobRegistry;
use crate::error::EngineError;
use crate::shared::replicator::{Replicator, SharedObject, SharedState};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

pub const FIB: &str = "fib";
pub const TREE_SUM: &str = "tree_sum";
pub const SEARCH: &str = "search";
pub const SEARCH_FOUND: &str = "search.found";

pub fn register_all(jobs: &JobRegistry) {
    jobs.register(FIB, fib);
    jobs.register(TREE_SUM, tree_sum);
    jobs.register(SEARCH, search);
}

/// Shared objects the demo jobs expect on every worker.
pub fn create_shared(replicator: &Arc<Replicator>) -> Result<(), EngineError> {
    replicator.create(SEARCH_FOUND, SearchFound::default())?;
    Ok(())
}

fn fib(ctx: &mut TaskContext<'_>, args: Value) -> Result<Value> {
    let n: u64 = serde_json::from_value(args)?;
    if n < 2 {
        return Ok(json!(n));
    }
    let a = ctx.spawn(FIB, n - 1)?;
    let b = ctx.spawn(FIB, n - 2)?;
    ctx.sync()?;
    let sum = ctx.result_as::<u64>(&a)? + ctx.result_as::<u64>(&b)?;
    Ok(json!(sum))
}

pub fn fib_sequential(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_sequential(n - 1) + fib_sequential(n - 2)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TreeNode {
    pub depth: u32,
    pub label: u64,
}

impl TreeNode {
    pub fn root(depth: u32) -> Self {
        Self { depth, label: 1 }
    }
}

fn tree_sum(ctx: &mut TaskContext<'_>, args: Value) -> Result<Value> {
    let node: TreeNode = serde_json::from_value(args)?;
    if node.depth <= 1 {
        return Ok(json!(node.label));
    }
    let child = |label| TreeNode {
        depth: node.depth - 1,
        label,
    };
    let left = ctx.spawn(TREE_SUM, child(node.label * 2))?;
    let right = ctx.spawn(TREE_SUM, child(node.label * 2 + 1))?;
    ctx.sync()?;
    let sum = node.label + ctx.result_as::<u64>(&left)? + ctx.result_as::<u64>(&right)?;
    Ok(json!(sum))
}

pub fn tree_sum_sequential(depth: u32) -> u64 {
    let nodes = (1u64 << depth) - 1;
    nodes * (nodes + 1) / 2
}

/// Lowest index found so far by any worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFound {
    pub index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SearchWrite {
    Found(u64),
}

impl SharedState for SearchFound {
    type Write = SearchWrite;

    fn apply(&mut self, write: &SearchWrite) {
        let SearchWrite::Found(index) = write;
        self.index = Some(self.index.map_or(*index, |current| current.min(*index)));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchRange {
    pub lo: u64,
    pub hi: u64,
    pub target: u64,
    pub grain: u64,
}

impl SearchRange {
    /// Elements in `lo..hi`; an inverted range is empty.
    pub fn len(&self) -> u64 {
        self.hi.saturating_sub(self.lo)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deterministic pseudo-random array element.
pub fn element(index: u64) -> u64 {
    index.wrapping_mul(2_654_435_761) % 1_000_003
}

fn search(ctx: &mut TaskContext<'_>, args: Value) -> Result<Value> {
    let range: SearchRange = serde_json::from_value(args)?;
    let found: Option<SharedObject<SearchFound>> = ctx.shared(SEARCH_FOUND);
    let already_found = |found: &Option<SharedObject<SearchFound>>| {
        found
            .as_ref()
            .map(|object| object.read(|state| state.index.is_some()))
            .unwrap_or(false)
    };

    if range.len() <= range.grain.max(1) {
        if already_found(&found) {
            return Ok(Value::Null);
        }
        let hit = (range.lo..range.hi).find(|&i| element(i) == range.target);
        if let (Some(index), Some(object)) = (hit, &found) {
            object.write(SearchWrite::Found(index))?;
        }
        return Ok(json!(hit));
    }

    let mid = range.lo + range.len() / 2;
    let left = ctx.spawn(SEARCH, SearchRange { hi: mid, ..range })?;
    let right = ctx.spawn(SEARCH, SearchRange { lo: mid, ..range })?;

    if already_found(&found) {
        tracing::debug!("{} cut off: target already found", ctx.stamp());
        ctx.abort_all();
    }
    ctx.sync()?;

    let hit = [left, right]
        .iter()
        .filter_map(|child| ctx.result_as::<Option<u64>>(child).ok().flatten())
        .min();
    Ok(json!(hit))
}
