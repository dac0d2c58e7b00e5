//! Shared-Object Replicator.
//!
//! Every worker holds a full replica of each shared object. A write is
//! applied to the local replica immediately, then queued and broadcast to
//! all live members, who apply it on receipt. Reads are always local.
//!
//! Writes from one sender are applied everywhere in that sender's order;
//! writes from different senders may interleave differently on different
//! replicas.

use crate::engine::stats::{bump, WorkerStats};
use crate::engine::types::WorkerId;
use crate::error::EngineError;
use crate::membership::registry::Registry;
use crate::transport::protocol::Message;
use crate::transport::Transport;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

const FETCH_POLL: Duration = Duration::from_millis(50);

/// State of a replicated object. `apply` must be deterministic: replicas
/// that apply the same writes in the same order end up equal.
pub trait SharedState: Serialize + DeserializeOwned + Send + 'static {
    type Write: Serialize + DeserializeOwned + Send + 'static;

    fn apply(&mut self, write: &Self::Write);
}

/// One replicated write, as broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoInvocation {
    pub object_id: String,
    /// Per-sender sequence number.
    pub seq: u64,
    pub write: Value,
}

trait Replica: Send + Sync {
    fn apply_json(&self, write: &Value) -> Result<(), serde_json::Error>;
    fn snapshot(&self) -> Result<Value, serde_json::Error>;
    fn restore(&self, state: Value) -> Result<(), serde_json::Error>;
}

struct TypedReplica<T: SharedState> {
    state: Mutex<T>,
}

impl<T: SharedState> Replica for TypedReplica<T> {
    fn apply_json(&self, write: &Value) -> Result<(), serde_json::Error> {
        let write: T::Write = serde_json::from_value(write.clone())?;
        self.state.lock().apply(&write);
        Ok(())
    }

    fn snapshot(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(&*self.state.lock())
    }

    fn restore(&self, state: Value) -> Result<(), serde_json::Error> {
        let state: T = serde_json::from_value(state)?;
        *self.state.lock() = state;
        Ok(())
    }
}

/// Writes not yet broadcast. Sequence numbers are handed out under the same
/// lock that broadcasts them, so batches leave in sequence order.
#[derive(Default)]
struct Outbox {
    next_seq: u64,
    pending: Vec<SoInvocation>,
}

struct ObjectSlot {
    replica: Arc<dyn Replica>,
    typed: Arc<dyn Any + Send + Sync>,
}

pub struct Replicator {
    local: WorkerId,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn Registry>,
    objects: DashMap<String, ObjectSlot>,
    /// Highest sequence number applied, per sender.
    last_applied: DashMap<WorkerId, u64>,
    outbox: Mutex<Outbox>,
    batch_size: usize,
    /// State transfers received, per object.
    transfers: Mutex<HashMap<String, u64>>,
    transfer_arrived: Condvar,
    stats: Arc<WorkerStats>,
}

impl Replicator {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn Registry>,
        batch_size: usize,
        stats: Arc<WorkerStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: transport.local_id().clone(),
            transport,
            registry,
            objects: DashMap::new(),
            last_applied: DashMap::new(),
            outbox: Mutex::new(Outbox::default()),
            batch_size: batch_size.max(1),
            transfers: Mutex::new(HashMap::new()),
            transfer_arrived: Condvar::new(),
            stats,
        })
    }

    /// Registers the local replica of `id`. Every worker creates the object
    /// with the same initial state, or fetches it with `request_state`.
    /// Creating an id twice returns the existing replica.
    pub fn create<T: SharedState>(
        self: &Arc<Self>,
        id: &str,
        initial: T,
    ) -> Result<SharedObject<T>, EngineError> {
        if let Some(existing) = self.get::<T>(id) {
            return Ok(existing);
        }

        let replica = Arc::new(TypedReplica {
            state: Mutex::new(initial),
        });
        self.objects
            .entry(id.to_string())
            .or_insert_with(|| ObjectSlot {
                replica: replica.clone(),
                typed: replica,
            });
        tracing::debug!("Shared object '{}' created on {}", id, self.local);

        self.get::<T>(id)
            .ok_or_else(|| EngineError::TypeMismatch(id.to_string()))
    }

    /// Handle to the local replica of `id`, if it exists with type `T`.
    pub fn get<T: SharedState>(self: &Arc<Self>, id: &str) -> Option<SharedObject<T>> {
        let typed = self.objects.get(id).map(|slot| slot.typed.clone())?;
        let replica = typed.downcast::<TypedReplica<T>>().ok()?;
        Some(SharedObject {
            id: id.to_string(),
            replica,
            replicator: self.clone(),
            _state: PhantomData,
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.contains_key(id)
    }

    fn enqueue(&self, object_id: &str, write: Value) {
        bump(&self.stats.so_writes);
        let mut outbox = self.outbox.lock();
        outbox.next_seq += 1;
        let seq = outbox.next_seq;
        outbox.pending.push(SoInvocation {
            object_id: object_id.to_string(),
            seq,
            write,
        });
        if outbox.pending.len() >= self.batch_size {
            self.broadcast_pending(&mut outbox);
        }
    }

    /// Broadcasts every queued write to the live members.
    pub fn flush(&self) -> usize {
        let mut outbox = self.outbox.lock();
        self.broadcast_pending(&mut outbox)
    }

    fn broadcast_pending(&self, outbox: &mut Outbox) -> usize {
        if outbox.pending.is_empty() {
            return 0;
        }
        let invocations = std::mem::take(&mut outbox.pending);
        let count = invocations.len();
        let peers: Vec<WorkerId> = self
            .registry
            .current_members()
            .into_iter()
            .map(|m| m.id)
            .filter(|id| id != &self.local)
            .collect();
        tracing::trace!("Broadcasting {} shared-object writes to {} peers", count, peers.len());
        self.transport
            .broadcast(&peers, Message::SoBatch { invocations });
        count
    }

    pub fn pending_writes(&self) -> usize {
        self.outbox.lock().pending.len()
    }

    /// Applies a batch received from `from`. Already-applied sequence numbers
    /// and unknown objects are skipped.
    pub fn handle_batch(&self, from: &WorkerId, invocations: Vec<SoInvocation>) -> usize {
        let mut applied = 0;
        for invocation in invocations {
            {
                let mut last = self.last_applied.entry(from.clone()).or_insert(0);
                if invocation.seq <= *last {
                    tracing::debug!(
                        "Duplicate shared-object write {} from {} ignored",
                        invocation.seq,
                        from
                    );
                    continue;
                }
                *last = invocation.seq;
            }

            let replica = self
                .objects
                .get(&invocation.object_id)
                .map(|slot| slot.replica.clone());
            let Some(replica) = replica else {
                tracing::warn!(
                    "Write for unknown shared object '{}' from {} dropped",
                    invocation.object_id,
                    from
                );
                continue;
            };

            match replica.apply_json(&invocation.write) {
                Ok(()) => {
                    applied += 1;
                    bump(&self.stats.so_applies);
                }
                Err(e) => tracing::warn!(
                    "Malformed write for '{}' from {}: {}",
                    invocation.object_id,
                    from,
                    e
                ),
            }
        }
        applied
    }

    /// Asks `peer` for its replica of `object_id`.
    pub fn request_state(&self, peer: &WorkerId, object_id: &str) -> Result<(), EngineError> {
        self.transport.send(
            peer,
            Message::SoRequest {
                object_id: object_id.to_string(),
            },
        )?;
        Ok(())
    }

    /// Requests `object_id` from `peer` and waits for the transfer. Returns
    /// false when `timeout` passes or `peer` dies first.
    pub fn fetch_state(
        &self,
        peer: &WorkerId,
        object_id: &str,
        timeout: Duration,
    ) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        let mut transfers = self.transfers.lock();
        let before = transfers.get(object_id).copied().unwrap_or(0);
        self.request_state(peer, object_id)?;
        bump(&self.stats.so_fetches);

        loop {
            if transfers.get(object_id).copied().unwrap_or(0) > before {
                return Ok(true);
            }
            if !self.registry.is_alive(peer) {
                tracing::debug!("{} died before sending '{}'", peer, object_id);
                return Ok(false);
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(false);
            }
            self.transfer_arrived
                .wait_for(&mut transfers, left.min(FETCH_POLL));
        }
    }

    pub fn handle_request(&self, from: &WorkerId, object_id: &str) {
        let replica = self.objects.get(object_id).map(|slot| slot.replica.clone());
        let Some(replica) = replica else {
            tracing::debug!("State request for unknown object '{}' from {}", object_id, from);
            return;
        };
        match replica.snapshot() {
            Ok(state) => {
                let message = Message::SoTransfer {
                    object_id: object_id.to_string(),
                    state,
                };
                if let Err(e) = self.transport.send(from, message) {
                    tracing::warn!("State transfer of '{}' to {} failed: {}", object_id, from, e);
                }
            }
            Err(e) => tracing::error!("Snapshot of '{}' failed: {}", object_id, e),
        }
    }

    /// Replaces the local replica's state with a transferred snapshot.
    pub fn handle_transfer(&self, object_id: &str, state: Value) {
        let replica = self.objects.get(object_id).map(|slot| slot.replica.clone());
        match replica {
            Some(replica) => {
                if let Err(e) = replica.restore(state) {
                    tracing::warn!("Malformed state transfer for '{}': {}", object_id, e);
                    return;
                }
                tracing::debug!("Shared object '{}' initialised from transfer", object_id);
                *self.transfers.lock().entry(object_id.to_string()).or_insert(0) += 1;
                self.transfer_arrived.notify_all();
            }
            None => tracing::warn!("State transfer for unknown object '{}' dropped", object_id),
        }
    }
}

/// Typed handle to a local replica.
pub struct SharedObject<T: SharedState> {
    id: String,
    replica: Arc<TypedReplica<T>>,
    replicator: Arc<Replicator>,
    _state: PhantomData<fn() -> T>,
}

impl<T: SharedState> Clone for SharedObject<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            replica: self.replica.clone(),
            replicator: self.replicator.clone(),
            _state: PhantomData,
        }
    }
}

impl<T: SharedState> SharedObject<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Applies `write` locally and queues it for every other replica.
    pub fn write(&self, write: T::Write) -> Result<(), EngineError> {
        let encoded = serde_json::to_value(&write)?;
        self.replica.state.lock().apply(&write);
        self.replicator.enqueue(&self.id, encoded);
        Ok(())
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.replica.state.lock())
    }
}

impl<T: SharedState + Clone> SharedObject<T> {
    pub fn snapshot(&self) -> T {
        self.replica.state.lock().clone()
    }
}
