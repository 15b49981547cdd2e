//! Typed error taxonomy for the library surface.
//!
//! The demo binary (`src/bin/workerctl.rs`) wraps these in `anyhow` at its own boundary,
//! the way the teacher's `main.rs` does for its own operations; library code always
//! returns [`CoreError`] so callers can match on kind.

use crate::ids::WorkerId;
use serde_json::Value;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kinds, matching the taxonomy: Spawn, Transport, Framing, Serialization,
/// Protocol, Peer, Timeout, Closed, Shutdown, Heartbeat, plus a few structural
/// errors (unknown/duplicate worker, invalid method name) needed to report
/// registry misuse.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("spawn failed for worker {worker_id} after {attempts} attempt(s): {last_cause}")]
    Spawn {
        worker_id: WorkerId,
        attempts: u32,
        last_cause: String,
    },

    #[error("transport error on {endpoint}: {cause}")]
    Transport { endpoint: String, cause: String },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer error {code}: {message}")]
    Peer {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("request timed out")]
    Timeout,

    #[error("channel closed")]
    Closed,

    #[error("channel already started")]
    AlreadyStarted,

    #[error("shutdown error: {0}")]
    Shutdown(String),

    #[error("worker unresponsive after {missed} missed heartbeat(s)")]
    Heartbeat { missed: u32 },

    #[error("worker {0} is not registered")]
    UnknownWorker(WorkerId),

    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),

    #[error("invalid worker id: {0}")]
    InvalidWorkerId(String),

    #[error("method name {0:?} is reserved (matches ^__.*__$)")]
    ReservedMethod(String),

    #[error("worker is not running")]
    NotRunning,

    #[error("data channel was not enabled for this worker")]
    DataChannelDisabled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// True for errors that should not close the owning channel (serialization
    /// and protocol errors per the propagation policy).
    pub fn is_channel_fatal(&self) -> bool {
        matches!(self, CoreError::Framing(_) | CoreError::Transport { .. })
    }
}
