//! UDP gossip registry for real deployments.
//!
//! Each node pings one random alive peer per round and answers pings with
//! its full member list. Silence moves a member to `Suspect`, then `Dead`.
//! A suspected node refutes by bumping its incarnation. Every change the
//! engine cares about (a new alive member, a death, a departure) is
//! published on the event channel.

use anyhow::Result;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use super::registry::Registry;
use super::types::{GossipMessage, Member, MembershipEvent, Node, NodeId, NodeState};

const EVENT_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 65_536;

#[derive(Debug, Clone, Copy)]
pub struct GossipTimings {
    pub ping_interval: Duration,
    pub sweep_interval: Duration,
    pub suspect_after: Duration,
    pub dead_after: Duration,
}

impl Default for GossipTimings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(2),
            suspect_after: Duration::from_secs(5),
            dead_after: Duration::from_secs(10),
        }
    }
}

/// Members whose state a failure-detection sweep changed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Sweep {
    pub suspected: Vec<(NodeId, u64)>,
    pub died: Vec<NodeId>,
}

pub struct MembershipService {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    timings: GossipTimings,
    events: broadcast::Sender<MembershipEvent>,
}

impl MembershipService {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        cluster: &str,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        Self::with_timings(bind_addr, http_addr, cluster, seed_nodes, GossipTimings::default()).await
    }

    pub async fn with_timings(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        cluster: &str,
        seed_nodes: Vec<SocketAddr>,
        timings: GossipTimings,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let gossip_addr = socket.local_addr()?;

        // Named after the gossip address so peers can be addressed on the command line.
        let local_node = Node {
            id: NodeId::named(&gossip_addr.to_string()),
            gossip_addr,
            http_addr,
            cluster: cluster.to_string(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let service = Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            timings,
            events,
        });

        if !seed_nodes.is_empty() {
            tracing::info!("Joining cluster via {} seed node(s)", seed_nodes.len());
            let join = GossipMessage::Join {
                node: service.local_node.clone(),
            };
            for seed in &seed_nodes {
                service.send(&join, *seed).await?;
                tracing::info!("Sent join request to {}", seed);
            }
        }

        Ok(service)
    }

    /// Spawns the ping, receive and failure-detection loops.
    pub async fn start(self: Arc<Self>) {
        tokio::spawn(self.clone().ping_loop());
        tokio::spawn(self.clone().receive_loop());
        tokio::spawn(self.clone().sweep_loop());
        tracing::info!("Membership service started on {}", self.local_node.gossip_addr);
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    /// Announces an orderly departure to every alive peer.
    pub async fn leave(&self) {
        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
        };
        self.broadcast(&msg).await;
        tracing::info!("Left the cluster");
    }

    fn publish(&self, event: MembershipEvent) {
        // No subscribers is fine: the engine may not be running yet.
        let _ = self.events.send(event);
    }

    fn peers(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| {
                entry.key() != &self.local_node.id && entry.value().state == NodeState::Alive
            })
            .map(|entry| entry.value().clone())
            .collect()
    }

    async fn send(&self, msg: &GossipMessage, to: SocketAddr) -> Result<()> {
        let encoded = bincode::serialize(msg)?;
        self.socket.send_to(&encoded, to).await?;
        Ok(())
    }

    async fn broadcast(&self, msg: &GossipMessage) {
        for peer in self.peers() {
            if let Err(e) = self.send(msg, peer.gossip_addr).await {
                tracing::warn!("Gossip to {} failed: {}", peer.id, e);
            }
        }
    }

    fn ack(&self) -> GossipMessage {
        GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation.load(Ordering::Relaxed),
            members: self.members.iter().map(|entry| entry.value().clone()).collect(),
        }
    }

    // --- Loops ---

    async fn ping_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timings.ping_interval);
        loop {
            interval.tick().await;
            let Some(target) = self.peers().choose(&mut rand::thread_rng()).cloned() else {
                continue;
            };
            let ping = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.incarnation.load(Ordering::Relaxed),
            };
            match self.send(&ping, target.gossip_addr).await {
                Ok(()) => tracing::trace!("Sent ping to {}", target.id),
                Err(e) => tracing::warn!("Failed to send ping to {}: {}", target.id, e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let msg = match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("Malformed gossip from {}: {}", src, e);
                    continue;
                }
            };
            for (reply, to) in self.handle_message(msg, src) {
                if let Err(e) = self.send(&reply, to).await {
                    tracing::warn!("Gossip reply to {} failed: {}", to, e);
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.timings.sweep_interval);
        loop {
            interval.tick().await;
            let sweep = self.sweep(Instant::now());
            for (node_id, incarnation) in sweep.suspected {
                self.broadcast(&GossipMessage::Suspect {
                    node_id,
                    incarnation,
                })
                .await;
            }
        }
    }

    // --- Protocol ---

    /// Applies one gossip message. Returns the datagrams to send in response.
    pub fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Vec<(GossipMessage, SocketAddr)> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                tracing::trace!("Ping from {}", from);
                self.touch(&from, incarnation);
                vec![(self.ack(), src)]
            }
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.touch(&from, incarnation);
                for member in members {
                    self.merge(member);
                }
                Vec::new()
            }
            GossipMessage::Join { node } => {
                tracing::info!("Node {} joining at {}", node.id, node.gossip_addr);
                self.merge(Node {
                    state: NodeState::Alive,
                    ..node
                });
                // The joiner learns the cluster without waiting for a ping.
                vec![(self.ack(), src)]
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } if node_id == self.local_node.id => self.refute(incarnation),
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.apply_rumor(&node_id, NodeState::Suspect, incarnation);
                Vec::new()
            }
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.apply_rumor(&node_id, NodeState::Alive, incarnation);
                Vec::new()
            }
            GossipMessage::Leave { node_id } => {
                let incarnation = self
                    .members
                    .get(&node_id)
                    .map(|entry| entry.incarnation + 1)
                    .unwrap_or(0);
                self.apply_rumor(&node_id, NodeState::Left, incarnation);
                Vec::new()
            }
        }
    }

    /// Direct contact: the member is alive right now.
    fn touch(&self, id: &NodeId, incarnation: u64) {
        if let Some(mut member) = self.members.get_mut(id) {
            member.last_seen = Some(Instant::now());
            member.incarnation = member.incarnation.max(incarnation);
            if member.state == NodeState::Suspect {
                member.state = NodeState::Alive;
            }
        }
    }

    /// Answers a suspicion about ourselves with a newer `Alive` to every peer.
    fn refute(&self, incarnation: u64) -> Vec<(GossipMessage, SocketAddr)> {
        let current = self.incarnation.load(Ordering::Relaxed);
        if incarnation < current {
            return Vec::new();
        }
        let next = incarnation + 1;
        self.incarnation.store(next, Ordering::Relaxed);
        tracing::info!("Refuting suspicion about myself (inc={})", next);

        let alive = GossipMessage::Alive {
            node_id: self.local_node.id.clone(),
            incarnation: next,
        };
        self.peers()
            .into_iter()
            .map(|peer| (alive.clone(), peer.gossip_addr))
            .collect()
    }

    /// Learns about a member from another node's list.
    fn merge(&self, node: Node) {
        if node.id == self.local_node.id {
            return;
        }
        if !self.members.contains_key(&node.id) {
            if node.state != NodeState::Alive {
                return;
            }
            tracing::info!("Discovered member {} at {}", node.id, node.gossip_addr);
            let id = node.id.clone();
            self.members.insert(
                id.clone(),
                Node {
                    last_seen: Some(Instant::now()),
                    ..node
                },
            );
            self.publish(MembershipEvent::Joined(id));
            return;
        }
        self.apply_rumor(&node.id, node.state, node.incarnation);
    }

    /// Moves a known member to `state` when the rumor is newer than what we
    /// hold. Dead and departed members never come back under the same id:
    /// their work has already been recovered.
    fn apply_rumor(&self, id: &NodeId, state: NodeState, incarnation: u64) {
        let event = {
            let Some(mut member) = self.members.get_mut(id) else {
                tracing::debug!("Rumor about unknown node {} ignored", id);
                return;
            };
            if matches!(member.state, NodeState::Dead | NodeState::Left) {
                return;
            }
            let newer = incarnation > member.incarnation
                || (incarnation == member.incarnation && precedence(state) > precedence(member.state));
            if !newer || member.state == state {
                member.incarnation = member.incarnation.max(incarnation);
                return;
            }

            tracing::debug!("{}: {:?} -> {:?} (inc={})", id, member.state, state, incarnation);
            member.state = state;
            member.incarnation = incarnation;
            member.last_seen = Some(Instant::now());
            match state {
                NodeState::Dead => Some(MembershipEvent::Died(id.clone())),
                NodeState::Left => Some(MembershipEvent::Left(id.clone())),
                NodeState::Alive | NodeState::Suspect => None,
            }
        };

        if let Some(event) = event {
            tracing::info!("Membership change: {:?}", event);
            self.publish(event);
        }
    }

    /// Local verdict that `id` is dead, from a failure outside gossip.
    pub fn declare_dead(&self, id: &NodeId) {
        if id == &self.local_node.id {
            return;
        }
        let incarnation = match self.members.get(id) {
            Some(member) => member.incarnation,
            None => return,
        };
        tracing::warn!("Node {} declared dead: unreachable", id);
        self.apply_rumor(id, NodeState::Dead, incarnation);
    }

    /// Failure detection at `now`: silent members become suspects, silent
    /// suspects die.
    pub fn sweep(&self, now: Instant) -> Sweep {
        let mut sweep = Sweep::default();
        for mut entry in self.members.iter_mut() {
            let member = entry.value_mut();
            if member.id == self.local_node.id {
                continue;
            }
            let Some(last_seen) = member.last_seen else {
                member.last_seen = Some(now);
                continue;
            };
            let silent = now.saturating_duration_since(last_seen);

            match member.state {
                NodeState::Alive if silent > self.timings.suspect_after => {
                    tracing::warn!("Node {} suspected (silent for {:?})", member.id, silent);
                    member.state = NodeState::Suspect;
                    sweep.suspected.push((member.id.clone(), member.incarnation));
                }
                NodeState::Suspect if silent > self.timings.dead_after => {
                    tracing::warn!("Node {} declared dead (silent for {:?})", member.id, silent);
                    member.state = NodeState::Dead;
                    sweep.died.push(member.id.clone());
                }
                _ => {}
            }
        }

        for id in &sweep.died {
            self.publish(MembershipEvent::Died(id.clone()));
        }
        if !sweep.died.is_empty() {
            tracing::info!("Cluster size now: {} alive nodes", self.get_alive_members().len());
        }
        sweep
    }
}

/// Which state wins between rumors of equal incarnation.
fn precedence(state: NodeState) -> u8 {
    match state {
        NodeState::Alive => 0,
        NodeState::Suspect => 1,
        NodeState::Left => 2,
        NodeState::Dead => 3,
    }
}

impl Registry for MembershipService {
    fn local_id(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn current_members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self
            .get_alive_members()
            .iter()
            .map(Member::from)
            .collect();
        members.sort_by(|a, b| a.id.cmp(&b.id));
        members
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn is_alive(&self, id: &NodeId) -> bool {
        self.members
            .get(id)
            .map(|entry| entry.value().state == NodeState::Alive)
            .unwrap_or(false)
    }

    fn report_unreachable(&self, id: &NodeId) {
        self.declare_dead(id);
    }
}
