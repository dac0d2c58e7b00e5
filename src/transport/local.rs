//! In-process network.
//!
//! Each connected worker owns an unbounded inbox. A send is a single channel
//! push, so per-pair FIFO order holds trivially. `disconnect` models a crash:
//! the inbox is dropped and further sends to that worker fail.

use super::protocol::{Envelope, Message};
use super::{Inbox, Transport};
use crate::engine::types::WorkerId;
use crate::error::TransportError;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct LocalNetwork {
    inboxes: DashMap<WorkerId, mpsc::UnboundedSender<Envelope>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: DashMap::new(),
        })
    }

    pub fn connect(self: &Arc<Self>, id: WorkerId) -> (Arc<LocalTransport>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(id.clone(), tx);
        let transport = Arc::new(LocalTransport {
            local: id,
            network: self.clone(),
        });
        (transport, rx)
    }

    pub fn disconnect(&self, id: &WorkerId) {
        if self.inboxes.remove(id).is_some() {
            tracing::debug!("Worker {} disconnected from local network", id);
        }
    }

    pub fn is_connected(&self, id: &WorkerId) -> bool {
        self.inboxes.contains_key(id)
    }

    fn deliver(&self, from: &WorkerId, to: &WorkerId, message: Message) -> Result<(), TransportError> {
        let inbox = self
            .inboxes
            .get(to)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::PeerUnknown(to.clone()))?;

        inbox
            .send(Envelope {
                from: from.clone(),
                message,
            })
            .map_err(|_| TransportError::PeerGone(to.clone()))
    }
}

pub struct LocalTransport {
    local: WorkerId,
    network: Arc<LocalNetwork>,
}

impl Transport for LocalTransport {
    fn local_id(&self) -> &WorkerId {
        &self.local
    }

    fn send(&self, to: &WorkerId, message: Message) -> Result<(), TransportError> {
        // A crashed worker sends nothing.
        if !self.network.is_connected(&self.local) {
            return Err(TransportError::Closed);
        }
        tracing::trace!("{} -> {}: {}", self.local, to, message.kind());
        self.network.deliver(&self.local, to, message)
    }
}
