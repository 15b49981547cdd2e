//! Transport (C1): byte-stream to a child process's stdio, or to a socket endpoint.
//!
//! Grounded on the teacher's `IpcTransport` (`examples/redhat-performance-rusty-comms/src/ipc/mod.rs`),
//! narrowed from a benchmark-oriented multi-mechanism trait down to the capability set
//! this core actually needs: connect, write, read, disconnect, state.

mod socket_client;
mod socket_server;
mod stdio_child;

pub use socket_client::SocketClient;
pub use socket_server::SocketServer;
pub use stdio_child::StdioChild;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Default deadline for `connect()` to reach a connected state (§4.1).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on buffered bytes before a framer has consumed them (§4.1).
pub const DEFAULT_MAX_STDOUT_BUFFER: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_STDERR_BUFFER: usize = 1 * 1024 * 1024;

/// Connection state shared by every transport variant (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Byte-stream transport: stdio to a child process, or a socket endpoint in
/// client or server role.
///
/// `read` delivers raw bytes with no assumption about framing — a single logical
/// message may span multiple calls, or multiple messages may arrive in one call,
/// matching `onData`'s contract in §4.1.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection. Fails if already connected, or if the
    /// endpoint does not become reachable within the configured deadline.
    async fn connect(&mut self) -> Result<()>;

    /// Writes `buf` to the transport, returning once the OS has accepted it.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Reads whatever is currently available into `buf`, returning the number
    /// of bytes read. Returns `Ok(0)` on a clean EOF.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Idempotent teardown of OS resources. Must succeed even on failure paths.
    async fn disconnect(&mut self) -> Result<()>;

    fn state(&self) -> TransportState;

    /// Called whenever the channel's framer has fully drained its backlog
    /// (§4.1: a transport tracking unconsumed bytes against a bound resets
    /// that counter here). Default no-op for transports that don't track one.
    fn note_drained(&mut self) {}
}
