//! Victim selection and idle backoff for random work stealing.

use super::types::WorkerId;
use crate::config::{EngineConfig, VictimPolicy};
use crate::membership::types::Member;

use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

pub struct VictimSelector {
    policy: VictimPolicy,
}

impl VictimSelector {
    pub fn new(policy: VictimPolicy) -> Self {
        Self { policy }
    }

    /// Up to `limit` peers to ask, in asking order. Never includes `local`.
    pub fn candidates(&self, local: &WorkerId, members: &[Member], limit: usize) -> Vec<WorkerId> {
        let mut peers: Vec<&Member> = members.iter().filter(|m| &m.id != local).collect();
        peers.shuffle(&mut rand::thread_rng());

        if self.policy == VictimPolicy::ClusterAware {
            if let Some(home) = members.iter().find(|m| &m.id == local) {
                // Stable: keeps the shuffle within each group.
                peers.sort_by_key(|m| m.cluster != home.cluster);
            }
        }

        peers
            .into_iter()
            .take(limit)
            .map(|m| m.id.clone())
            .collect()
    }
}

/// Randomized exponential backoff between failed idle rounds.
pub struct StealBackoff {
    min_ms: u64,
    max_ms: u64,
    failures: AtomicU32,
}

impl StealBackoff {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            min_ms: config.backoff_min_ms,
            max_ms: config.backoff_max_ms.max(config.backoff_min_ms),
            failures: AtomicU32::new(0),
        }
    }

    pub fn next_delay(&self) -> Duration {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed).min(16);
        let ceiling = self
            .min_ms
            .max(1)
            .saturating_mul(1u64 << failures)
            .clamp(self.min_ms, self.max_ms);
        let delay = rand::thread_rng().gen_range(self.min_ms..=ceiling);
        Duration::from_millis(delay)
    }

    pub fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}
