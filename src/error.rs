//! Typed errors of the engine and its collaborators.

use crate::engine::types::Stamp;
use crate::membership::types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is not known to the transport")]
    PeerUnknown(NodeId),

    #[error("peer {0} is gone")]
    PeerGone(NodeId),

    #[error("transport closed")]
    Closed,

    #[error("http delivery to {peer} failed: {reason}")]
    Http { peer: NodeId, reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The current task was cancelled. Observed cooperatively at spawn, sync
    /// and result-report checkpoints.
    #[error("task {0} was aborted")]
    Aborted(Stamp),

    #[error("no job registered under '{0}'")]
    UnknownJob(String),

    /// A task ended with an application error. Raised at the parent's sync
    /// for a failed child, and by the root for its own failure.
    #[error("task {stamp} failed: {error}")]
    TaskFailed { stamp: Stamp, error: String },

    #[error("task {0} is not held by this worker")]
    UnknownTask(Stamp),

    /// The child was aborted, failed, or has not been synced yet.
    #[error("no result available for task {0}")]
    NoResult(Stamp),

    /// The worker holding the root died; no live ancestor can adopt its subtrees.
    #[error("root worker {0} died")]
    RootLost(NodeId),

    #[error("shared object '{0}' exists with a different type")]
    TypeMismatch(String),

    #[error("worker is shutting down")]
    Shutdown,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl EngineError {
    /// True when an application error is really an engine cancellation
    /// (abort or shutdown) propagated with `?`.
    pub fn is_abort(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::Aborted(_)) | Some(EngineError::Shutdown)
        )
    }
}
