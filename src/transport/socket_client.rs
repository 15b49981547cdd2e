use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Transport, TransportState, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{CoreError, Result};

/// Data-channel client transport: connects to a Unix domain socket path.
///
/// Grounded on the teacher's `UnixDomainSocketTransport::start_client`
/// (`examples/redhat-performance-rusty-comms/src/ipc/unix_domain_socket.rs`); the
/// client never owns the socket file and never unlinks it (§9 "Socket-file lifecycle").
pub struct SocketClient {
    path: PathBuf,
    connect_timeout: Duration,
    stream: Option<UnixStream>,
    state: TransportState,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stream: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for SocketClient {
    async fn connect(&mut self) -> Result<()> {
        if self.state == TransportState::Connected {
            return Err(CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: "already connected".into(),
            });
        }
        self.state = TransportState::Connecting;
        let stream = timeout(self.connect_timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: "connect timed out".into(),
            })?
            .map_err(|e| CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: e.to_string(),
            })?;
        debug!(path = %self.path.display(), "data channel client connected");
        self.stream = Some(stream);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| CoreError::Transport {
            endpoint: self.path.display().to_string(),
            cause: "not connected".into(),
        })?;
        let write_result = stream.write_all(buf).await.and(stream.flush().await.map(|_| ()));
        if let Err(e) = write_result {
            self.state = TransportState::Error;
            return Err(CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: e.to_string(),
            });
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| CoreError::Transport {
            endpoint: self.path.display().to_string(),
            cause: "not connected".into(),
        })?;
        stream.read(buf).await.map_err(|e| CoreError::Transport {
            endpoint: self.path.display().to_string(),
            cause: e.to_string(),
        })
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream = None;
        self.state = TransportState::Disconnected;
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state
    }
}
