//! Transport Module
//!
//! The engine's view of the network: a non-blocking `send` that preserves
//! per-pair FIFO order and a best-effort `broadcast`. Incoming envelopes are
//! delivered to one unbounded inbox per worker, drained by the worker's
//! message pump.
//!
//! ## Submodules
//! - **`protocol`**: the `Message` enum and endpoint constants.
//! - **`local`**: in-process network used by simulated clusters and tests.
//! - **`http`**: axum inbound endpoint + reqwest outbound, one FIFO sender per peer.

pub mod http;
pub mod local;
pub mod protocol;

#[cfg(test)]
mod tests;

use crate::engine::types::WorkerId;
use crate::error::TransportError;
use protocol::{Envelope, Message};
use tokio::sync::mpsc;

pub type Inbox = mpsc::UnboundedReceiver<Envelope>;

pub trait Transport: Send + Sync {
    fn local_id(&self) -> &WorkerId;

    /// Queues `message` for `to`. Never blocks; messages to the same peer are
    /// delivered in send order.
    fn send(&self, to: &WorkerId, message: Message) -> Result<(), TransportError>;

    /// Best-effort delivery to every listed peer. Peers that cannot be reached
    /// are skipped; the number of successful sends is returned.
    fn broadcast(&self, to: &[WorkerId], message: Message) -> usize {
        let mut delivered = 0;
        for peer in to {
            if peer == self.local_id() {
                continue;
            }
            match self.send(peer, message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Broadcast of {} to {} dropped: {}", message.kind(), peer, e),
            }
        }
        delivered
    }
}
