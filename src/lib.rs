//! # Worker IPC
//!
//! A local IPC framework for a supervisor process managing long-lived child
//! worker processes: a framed, versioned request/response/notification
//! protocol over stdio (control) and Unix domain sockets (data), process
//! lifecycle supervision with exponential-backoff restart, and a resilience
//! layer (heartbeat liveness, reconnect-with-queueing, graceful shutdown).

pub mod channel;
pub mod cli;
pub mod codec;
pub mod error;
pub mod events;
pub mod framing;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod process;
pub mod protocol;
pub mod resilience;
pub mod transport;

pub use channel::Channel;
pub use error::{CoreError, Result};
pub use ids::{RequestId, WorkerId};
pub use process::{ProcessHandle, ProcessManager, ProcessState, RestartPolicy, SpawnOptions};
pub use resilience::{HeartbeatManager, ReconnectManager, Resilient, ShutdownManager};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
