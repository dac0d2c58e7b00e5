//! Engine Wire Protocol
//!
//! Every message between two workers travels over one reliable, per-pair FIFO
//! channel: steal requests and replies, result returns, abort forwards,
//! shared-object traffic and Global Result Table updates. Abort forwards rely
//! on that ordering: a thief always sees the steal reply before any abort of
//! the stolen task.

use crate::engine::types::{ShippedTask, Stamp, TaskOutcome, WorkerId};
use crate::fault::grt::GrtEntry;
use crate::shared::replicator::SoInvocation;
use serde::{Deserialize, Serialize};

/// Inbound endpoint of the HTTP transport.
pub const ENDPOINT_MESSAGE: &str = "/internal/message";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    StealRequest,

    /// `None` means the victim had no eligible work.
    StealReply {
        task: Option<ShippedTask>,
    },

    JobResult {
        stamp: Stamp,
        outcome: TaskOutcome,
    },

    Abort {
        stamp: Stamp,
    },

    SoBatch {
        invocations: Vec<SoInvocation>,
    },

    SoRequest {
        object_id: String,
    },

    SoTransfer {
        object_id: String,
        state: serde_json::Value,
    },

    GrtUpdate {
        entries: Vec<GrtEntry>,
    },

    /// The root finished; leave the idle loop.
    Exit,

    /// Local only: the transport gave up delivering `message` to `to`.
    Undelivered {
        to: WorkerId,
        message: Box<Message>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::StealRequest => "steal_request",
            Message::StealReply { .. } => "steal_reply",
            Message::JobResult { .. } => "job_result",
            Message::Abort { .. } => "abort",
            Message::SoBatch { .. } => "so_batch",
            Message::SoRequest { .. } => "so_request",
            Message::SoTransfer { .. } => "so_transfer",
            Message::GrtUpdate { .. } => "grt_update",
            Message::Exit => "exit",
            Message::Undelivered { .. } => "undelivered",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: WorkerId,
    pub message: Message,
}
