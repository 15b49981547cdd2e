use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Transport, TransportState, DEFAULT_CONNECT_TIMEOUT};
use crate::error::{CoreError, Result};

/// Data-channel server transport: binds a Unix domain socket path, accepts a
/// single client connection, and presents it as a [`Transport`].
///
/// Grounded on the teacher's `UnixDomainSocketTransport::start_server`
/// (`examples/redhat-performance-rusty-comms/src/ipc/unix_domain_socket.rs`), narrowed
/// to the single-connection case this core needs (one worker, one data channel). It
/// owns the socket file and unlinks it on close / drop (§9 "Socket-file lifecycle").
pub struct SocketServer {
    path: PathBuf,
    accept_timeout: Duration,
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
    state: TransportState,
}

impl SocketServer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            accept_timeout: DEFAULT_CONNECT_TIMEOUT,
            listener: None,
            stream: None,
            state: TransportState::Disconnected,
        }
    }

    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    fn unlink(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove socket file: {e}");
            }
        }
    }
}

#[async_trait]
impl Transport for SocketServer {
    async fn connect(&mut self) -> Result<()> {
        if self.state == TransportState::Connected {
            return Err(CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: "already connected".into(),
            });
        }
        self.state = TransportState::Connecting;

        // Best-effort remove of a stale socket file before binding.
        let _ = std::fs::remove_file(&self.path);

        let listener = UnixListener::bind(&self.path).map_err(|e| CoreError::Transport {
            endpoint: self.path.display().to_string(),
            cause: e.to_string(),
        })?;

        #[cfg(unix)]
        {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&self.path, fs::Permissions::from_mode(0o660));
        }

        let (stream, _) = timeout(self.accept_timeout, listener.accept())
            .await
            .map_err(|_| CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: "accept timed out".into(),
            })?
            .map_err(|e| CoreError::Transport {
                endpoint: self.path.display().to_string(),
                cause: e.to_string(),
            })?;

        debug!(path = %self.path.display(), "data channel server accepted connection");
        self.listener = Some(listener);
        self.stream = Some(stream);
        self.state = TransportState::Connected;
        Ok(())
    }

    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| CoreError::Transport {
            endpoint: self.path.display().to_string(),
            cause: "not connected".into(),
        })?;
        let result = stream.write_all(buf).await.and(stream.flush().await);
        if let Err(e) = result {
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
        self.listener = None;
        self.state = TransportState::Disconnected;
        self.unlink();
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.unlink();
    }
}
