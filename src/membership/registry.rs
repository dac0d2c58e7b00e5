//! Registry seam consumed by the engine.
//!
//! The engine never decides membership; it asks a `Registry` who is alive and
//! listens for join/leave/death upcalls.

use super::types::{Member, MembershipEvent, NodeId};

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

pub trait Registry: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Live members, including the local worker.
    fn current_members(&self) -> Vec<Member>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;

    fn is_alive(&self, id: &NodeId) -> bool {
        self.current_members().iter().any(|member| &member.id == id)
    }

    /// The transport gave up on `id`. Treated as a death so the engine
    /// recovers whatever was waiting on it.
    fn report_unreachable(&self, id: &NodeId);
}

/// Shared membership table for in-process clusters.
///
/// Every worker of a simulated cluster holds a `StaticRegistry` view onto the
/// same table; `kill` and `leave` play the role of the failure detector.
pub struct MembershipTable {
    members: DashMap<NodeId, Member>,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipTable {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            members: DashMap::new(),
            events,
        })
    }

    pub fn join(&self, id: NodeId, cluster: &str) {
        self.members.insert(
            id.clone(),
            Member {
                id: id.clone(),
                cluster: cluster.to_string(),
            },
        );
        tracing::info!("Member {} joined (cluster {})", id, cluster);
        let _ = self.events.send(MembershipEvent::Joined(id));
    }

    pub fn leave(&self, id: &NodeId) {
        if self.members.remove(id).is_some() {
            tracing::info!("Member {} left", id);
            let _ = self.events.send(MembershipEvent::Left(id.clone()));
        }
    }

    pub fn kill(&self, id: &NodeId) {
        if self.members.remove(id).is_some() {
            tracing::warn!("Member {} died", id);
            let _ = self.events.send(MembershipEvent::Died(id.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Clone)]
pub struct StaticRegistry {
    local: NodeId,
    table: Arc<MembershipTable>,
}

impl StaticRegistry {
    pub fn new(local: NodeId, table: Arc<MembershipTable>) -> Arc<Self> {
        Arc::new(Self { local, table })
    }

    pub fn table(&self) -> &Arc<MembershipTable> {
        &self.table
    }
}

impl Registry for StaticRegistry {
    fn local_id(&self) -> NodeId {
        self.local.clone()
    }

    fn current_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .table
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.table.events.subscribe()
    }

    fn is_alive(&self, id: &NodeId) -> bool {
        self.table.members.contains_key(id)
    }

    fn report_unreachable(&self, id: &NodeId) {
        self.table.kill(id);
    }
}
