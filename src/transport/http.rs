//! HTTP transport for multi-process clusters.
//!
//! Inbound: an axum route that pushes every posted envelope into the local
//! inbox. Outbound: one delivery task per peer draining an unbounded queue,
//! so `send` never blocks and messages to a peer leave in order.
//!
//! A message that still fails after every retry is handed back to the local
//! inbox as `Message::Undelivered`, so the worker can recover from it. Queues
//! to dead or departed peers are dropped.

use super::protocol::{Envelope, Message, ENDPOINT_MESSAGE};
use super::{Inbox, Transport};
use crate::engine::types::WorkerId;
use crate::error::TransportError;
use crate::membership::service::MembershipService;
use crate::membership::types::NodeState;

use axum::{extract::Extension, http::StatusCode, routing::post, Json, Router};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);
const DELIVERY_ATTEMPTS: usize = 4;

/// Feeds envelopes into the local inbox without going through HTTP.
pub type Loopback = mpsc::UnboundedSender<Envelope>;

pub struct HttpTransport {
    local: WorkerId,
    membership: Arc<MembershipService>,
    http_client: reqwest::Client,
    senders: DashMap<WorkerId, mpsc::UnboundedSender<Message>>,
    loopback: Loopback,
    runtime: Handle,
}

impl HttpTransport {
    /// Must be called from inside the tokio runtime; outbound delivery tasks
    /// are spawned on it even when `send` is called from a blocking thread.
    pub fn new(membership: Arc<MembershipService>, loopback: Loopback) -> Arc<Self> {
        Arc::new(Self {
            local: membership.local_node.id.clone(),
            membership,
            http_client: reqwest::Client::new(),
            senders: DashMap::new(),
            loopback,
            runtime: Handle::current(),
        })
    }

    /// Router serving the inbound endpoint, the inbox it feeds, and a
    /// loopback into that same inbox.
    pub fn inbound() -> (Router, Inbox, Loopback) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new()
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .layer(Extension(tx.clone()));
        (router, rx, tx)
    }

    /// Peers with a live delivery queue.
    pub fn sender_count(&self) -> usize {
        self.senders.len()
    }

    fn sender_for(&self, peer: &WorkerId) -> Result<mpsc::UnboundedSender<Message>, TransportError> {
        let node = self
            .membership
            .get_member(peer)
            .ok_or_else(|| TransportError::PeerUnknown(peer.clone()))?;
        if matches!(node.state, NodeState::Dead | NodeState::Left) {
            if self.senders.remove(peer).is_some() {
                tracing::debug!("Delivery queue to departed {} released", peer);
            }
            return Err(TransportError::PeerGone(peer.clone()));
        }

        if let Some(tx) = self.senders.get(peer) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let url = format!("http://{}{}", node.http_addr, ENDPOINT_MESSAGE);
        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn(deliver_loop(
            Delivery {
                client: self.http_client.clone(),
                membership: self.membership.clone(),
                loopback: self.loopback.clone(),
                local: self.local.clone(),
                peer: peer.clone(),
                url,
            },
            rx,
        ));
        self.senders.insert(peer.clone(), tx.clone());
        Ok(tx)
    }
}

impl Transport for HttpTransport {
    fn local_id(&self) -> &WorkerId {
        &self.local
    }

    fn send(&self, to: &WorkerId, message: Message) -> Result<(), TransportError> {
        let tx = self.sender_for(to)?;
        tx.send(message).map_err(|_| TransportError::PeerGone(to.clone()))
    }
}

async fn handle_message(
    Extension(inbox): Extension<mpsc::UnboundedSender<Envelope>>,
    Json(envelope): Json<Envelope>,
) -> StatusCode {
    tracing::trace!("Inbound {} from {}", envelope.message.kind(), envelope.from);
    match inbox.send(envelope) {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Everything one peer's delivery task needs.
struct Delivery {
    client: reqwest::Client,
    membership: Arc<MembershipService>,
    loopback: Loopback,
    local: WorkerId,
    peer: WorkerId,
    url: String,
}

impl Delivery {
    fn peer_gone(&self) -> bool {
        self.membership
            .get_member(&self.peer)
            .map(|node| matches!(node.state, NodeState::Dead | NodeState::Left))
            .unwrap_or(true)
    }
}

async fn deliver_loop(delivery: Delivery, mut queue: mpsc::UnboundedReceiver<Message>) {
    let peer = &delivery.peer;
    while let Some(message) = queue.recv().await {
        let kind = message.kind();
        if delivery.peer_gone() {
            tracing::debug!("Dropping {} to departed {}", kind, peer);
            continue;
        }
        let envelope = Envelope {
            from: delivery.local.clone(),
            message,
        };

        let result = post_with_retry(&delivery.client, &delivery.url, &envelope, || {
            delivery.peer_gone()
        })
        .await;
        match result {
            Ok(()) => tracing::trace!("Delivered {} to {}", kind, peer),
            Err(_) if delivery.peer_gone() => {
                tracing::debug!("Dropping {} to departed {}", kind, peer);
            }
            Err(e) => {
                let err = TransportError::Http {
                    peer: peer.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("Giving up on {}: {}", kind, err);
                let undelivered = Envelope {
                    from: delivery.local.clone(),
                    message: Message::Undelivered {
                        to: peer.clone(),
                        message: Box::new(envelope.message),
                    },
                };
                if delivery.loopback.send(undelivered).is_err() {
                    tracing::debug!("Local inbox closed, {} to {} lost", kind, peer);
                }
            }
        }
    }
    tracing::debug!("Delivery queue to {} closed", peer);
}

/// Posts `payload`, retrying with backoff. Stops early once `gone` says the
/// peer left the cluster.
async fn post_with_retry<T, G>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
    gone: G,
) -> anyhow::Result<()>
where
    T: serde::Serialize,
    G: Fn() -> bool,
{
    let mut delay_ms = 150u64;

    for attempt in 0..DELIVERY_ATTEMPTS {
        if attempt > 0 && gone() {
            return Err(anyhow::anyhow!("peer left during retries"));
        }
        let response = client
            .post(url)
            .json(payload)
            .timeout(DELIVERY_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => return Err(anyhow::anyhow!("peer answered {}", resp.status())),
            Err(e) => {
                if attempt + 1 == DELIVERY_ATTEMPTS {
                    return Err(anyhow::anyhow!(e));
                }
                let jitter = rand::random::<u64>() % 50;
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(1200);
            }
        }
    }

    Err(anyhow::anyhow!("Retry attempts exhausted"))
}
