//! Process supervision (C6/C7): lifecycle state machine, spawn/terminate
//! orchestration, restart-on-crash policy.
//!
//! Grounded on the teacher's `coordination.rs` (`HostCoordinator`, `ServerProcess`)
//! for the registry-of-children shape, reworked from a one-shot benchmark spawn
//! into a long-lived supervised registry keyed by [`crate::ids::WorkerId`].

mod handle;
mod manager;
pub mod restart;

pub use handle::{HandleEvent, ProcessHandle};
pub use manager::{ManagerEvent, ProcessManager};
pub use restart::RestartPolicy;

use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle state of one supervised worker (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Spawning,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

/// Data-channel request, supplied at spawn time.
#[derive(Debug, Clone)]
pub struct DataChannelConfig {
    pub enabled: bool,
    /// Maximum frame size accepted on the data channel (§6 default 64 MiB).
    pub max_frame_size: usize,
}

impl Default for DataChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_frame_size: crate::framing::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Per-worker spawn inputs (§6 "Spawn inputs").
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub data_channel: DataChannelConfig,
    pub restart_policy: RestartPolicy,
    /// Deadline for the child to reach a connected stdio pipe pair (§4.1 default 10 s).
    pub startup_timeout: std::time::Duration,
    /// Deadline for `__handshake__` to complete.
    pub handshake_timeout: std::time::Duration,
    /// Cap on buffered stdout bytes the control channel's framer hasn't consumed yet
    /// (§4.1 default 10 MiB); exceeding it is fatal and kills the child.
    pub max_stdout_buffer: usize,
    /// Cap on buffered stderr bytes without a newline (§4.1 default 1 MiB); exceeding
    /// it is fatal and kills the child.
    pub max_stderr_buffer: usize,
}

impl SpawnOptions {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            data_channel: DataChannelConfig::default(),
            restart_policy: RestartPolicy::default(),
            startup_timeout: std::time::Duration::from_secs(10),
            handshake_timeout: std::time::Duration::from_secs(5),
            max_stdout_buffer: crate::transport::DEFAULT_MAX_STDOUT_BUFFER,
            max_stderr_buffer: crate::transport::DEFAULT_MAX_STDERR_BUFFER,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_data_channel(mut self) -> Self {
        self.data_channel.enabled = true;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }
}
