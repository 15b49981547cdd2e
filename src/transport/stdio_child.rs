use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tracing::{debug, error, warn};

use super::{Transport, TransportState, DEFAULT_MAX_STDERR_BUFFER, DEFAULT_MAX_STDOUT_BUFFER};
use crate::error::{CoreError, Result};
use crate::ids::WorkerId;

/// Control-channel transport over a child process's stdin/stdout.
///
/// The process itself is spawned by [`crate::process::ProcessManager`] (§4.7 step 3:
/// "Start the child process; attach control-channel transport to its stdio"); this
/// type only owns the pipe handles and forwards stderr to `tracing` for diagnostics,
/// matching §1's "stderr is exposed on a separate channel for logging."
///
/// Tracks bytes delivered via [`Transport::read`] that the channel's framer has not
/// yet fully drained (`note_drained` resets the count). Exceeding `max_stdout_buffer`
/// without a complete frame is fatal per §4.1: the transport errors, disconnects, and
/// kills the child so a misbehaving or wedged worker can't pin unbounded memory.
pub struct StdioChild {
    worker_id: WorkerId,
    pid: u32,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    state: TransportState,
    max_stdout_buffer: usize,
    unconsumed_stdout: usize,
}

impl StdioChild {
    pub fn new(worker_id: WorkerId, pid: u32, stdin: ChildStdin, stdout: ChildStdout, stderr: ChildStderr) -> Self {
        Self::with_buffer_bounds(
            worker_id,
            pid,
            stdin,
            stdout,
            stderr,
            DEFAULT_MAX_STDOUT_BUFFER,
            DEFAULT_MAX_STDERR_BUFFER,
        )
    }

    pub fn with_buffer_bounds(
        worker_id: WorkerId,
        pid: u32,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: ChildStderr,
        max_stdout_buffer: usize,
        max_stderr_buffer: usize,
    ) -> Self {
        spawn_stderr_forwarder(worker_id.clone(), pid, stderr, max_stderr_buffer);
        Self {
            worker_id,
            pid,
            stdin: Some(stdin),
            stdout: Some(stdout),
            state: TransportState::Disconnected,
            max_stdout_buffer,
            unconsumed_stdout: 0,
        }
    }
}

#[cfg(unix)]
fn kill_child(pid: u32, worker_id: &WorkerId, channel: &str) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        error!(worker = %worker_id, "failed to kill child after {channel} overflow: {e}");
    }
}

#[cfg(not(unix))]
fn kill_child(_pid: u32, _worker_id: &WorkerId, _channel: &str) {}

fn spawn_stderr_forwarder(worker_id: WorkerId, pid: u32, stderr: ChildStderr, max_stderr_buffer: usize) {
    tokio::spawn(async move {
        let mut stderr = stderr;
        let mut pending = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = match stderr.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(worker = %worker_id, "stderr forwarder stopped: {e}");
                    break;
                }
            };
            pending.extend_from_slice(&chunk[..n]);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line = pending.drain(..=newline).collect::<Vec<u8>>();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                warn!(worker = %worker_id, "{line}");
            }

            if pending.len() > max_stderr_buffer {
                error!(
                    worker = %worker_id,
                    "stderr backlog exceeded {max_stderr_buffer} bytes without a newline; killing child"
                );
                kill_child(pid, &worker_id, "stderr");
                break;
            }
        }
    });
}

#[async_trait]
impl Transport for StdioChild {
    async fn connect(&mut self) -> Result<()> {
        if self.state == TransportState::Connected {
            return Err(CoreError::Transport {
                endpoint: format!("stdio:{}", self.worker_id),
                cause: "already connected".into(),
            });
        }
        if self.stdin.is_none() || self.stdout.is_none() {
            return Err(CoreError::Transport {
                endpoint: format!("stdio:{}", self.worker_id),
                cause: "stdio pipes already taken".into(),
            });
        }
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| CoreError::Transport {
            endpoint: format!("stdio:{}", self.worker_id),
            cause: "stdin not connected".into(),
        })?;
        stdin.write_all(buf).await.map_err(|e| CoreError::Transport {
            endpoint: format!("stdio:{}", self.worker_id),
            cause: e.to_string(),
        })?;
        stdin.flush().await.map_err(|e| CoreError::Transport {
            endpoint: format!("stdio:{}", self.worker_id),
            cause: e.to_string(),
        })
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stdout = self.stdout.as_mut().ok_or_else(|| CoreError::Transport {
            endpoint: format!("stdio:{}", self.worker_id),
            cause: "stdout not connected".into(),
        })?;
        let n = stdout.read(buf).await.map_err(|e| CoreError::Transport {
            endpoint: format!("stdio:{}", self.worker_id),
            cause: e.to_string(),
        })?;

        self.unconsumed_stdout += n;
        if self.unconsumed_stdout > self.max_stdout_buffer {
            self.state = TransportState::Error;
            error!(
                worker = %self.worker_id,
                "stdout backlog exceeded {} bytes without a complete frame; killing child",
                self.max_stdout_buffer
            );
            kill_child(self.pid, &self.worker_id, "stdout");
            return Err(CoreError::Transport {
                endpoint: format!("stdio:{}", self.worker_id),
                cause: format!("unconsumed stdout exceeded {} bytes without a complete frame", self.max_stdout_buffer),
            });
        }

        Ok(n)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stdin = None;
        self.stdout = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state
    }

    fn note_drained(&mut self) {
        self.unconsumed_stdout = 0;
    }
}
