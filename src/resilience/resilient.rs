//! Resilient (C11): composes a [`ProcessHandle`] with heartbeat liveness and
//! graceful shutdown into one object application code drives directly.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::channel::{NotificationHandler, NotificationRouter};
use crate::error::Result;
use crate::process::{ProcessHandle, ProcessState};
use crate::protocol::reserved;

use super::heartbeat::{HeartbeatConfig, HeartbeatManager};
use super::shutdown::{ShutdownConfig, ShutdownManager, ShutdownReason};
use super::{HeartbeatEvent, ShutdownEvent};

/// Wraps a running [`ProcessHandle`] with heartbeat monitoring and graceful
/// shutdown, routing `__heartbeat_pong__` and `__shutdown_complete__` through a
/// single [`NotificationRouter`] installed on the control channel — the
/// `DataChannelWaiter` routing [`crate::process::ProcessManager::spawn`] installs
/// at spawn time has always finished by the time a caller wraps a handle here,
/// so overwriting that slot is safe.
///
/// Reconnection ([`super::ReconnectManager`]) is deliberately not wired in here:
/// a severed stdio control channel means the child process itself is gone, not
/// a transient link failure, so there is nothing to reconnect to. It remains a
/// standalone component callers can point at their own `Reconnectable`
/// transports (e.g. a data-channel `SocketClient`).
pub struct Resilient {
    handle: Arc<ProcessHandle>,
    heartbeat: Arc<HeartbeatManager>,
    shutdown: Arc<ShutdownManager>,
}

impl Resilient {
    /// Installs routing on the handle's control channel before returning, so no
    /// pong or shutdown-complete notification can arrive unrouted.
    pub async fn new(handle: Arc<ProcessHandle>, heartbeat_config: HeartbeatConfig, shutdown_config: ShutdownConfig) -> Arc<Self> {
        let heartbeat = HeartbeatManager::new(handle.control_channel().clone(), heartbeat_config);
        let shutdown = ShutdownManager::new(handle.clone(), shutdown_config);

        let router = Arc::new(NotificationRouter::new());
        router.on(reserved::HEARTBEAT_PONG, {
            let heartbeat = heartbeat.clone();
            Arc::new(move |params: Option<Value>| heartbeat.handle_pong(params))
        });
        router.on(reserved::SHUTDOWN_COMPLETE, {
            let shutdown = shutdown.clone();
            Arc::new(move |params: Option<Value>| shutdown.handle_complete(params))
        });

        let control = handle.control_channel().clone();
        control.on_notification(router as Arc<dyn NotificationHandler>).await;
        let heartbeat_for_activity = heartbeat.clone();
        control
            .on_activity(Arc::new(move || heartbeat_for_activity.handle_activity()))
            .await;

        heartbeat.start();
        Arc::new(Self {
            handle,
            heartbeat,
            shutdown,
        })
    }

    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }

    pub fn heartbeat_events(&self) -> tokio::sync::broadcast::Receiver<HeartbeatEvent> {
        self.heartbeat.events()
    }

    pub fn shutdown_events(&self) -> tokio::sync::broadcast::Receiver<ShutdownEvent> {
        self.shutdown.events()
    }

    pub fn is_healthy(&self) -> bool {
        self.handle.state() == ProcessState::Running
    }

    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        self.handle.request(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.handle.notify(method, params).await
    }

    /// Initiates graceful shutdown for `reason`, escalating to SIGKILL if the
    /// worker doesn't ack or complete in time.
    pub async fn shutdown(self: &Arc<Self>, reason: ShutdownReason) -> Result<()> {
        self.heartbeat.stop();
        self.shutdown.initiate(reason).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, RequestHandler};
    use crate::codec::JsonCodec;
    use crate::framing::LineFraming;
    use crate::ids::WorkerId;
    use crate::protocol::ErrorObject;
    use crate::transport::{Transport, TransportState};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::process::Command;

    struct DuplexTransport(DuplexStream);

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.0
                .write_all(buf)
                .await
                .map_err(|e| crate::error::CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.0
                .read(buf)
                .await
                .map_err(|e| crate::error::CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
        }

        async fn disconnect(&mut self) -> Result<()> {
            Ok(())
        }

        fn state(&self) -> TransportState {
            TransportState::Connected
        }
    }

    fn make_pair() -> (Channel, Channel) {
        let (a, b) = tokio::io::duplex(4096);
        let left = Channel::new(Box::new(DuplexTransport(a)), Box::new(LineFraming::default()), Arc::new(JsonCodec), "left");
        let right = Channel::new(Box::new(DuplexTransport(b)), Box::new(LineFraming::default()), Arc::new(JsonCodec), "right");
        (left, right)
    }

    /// Answers pings with pongs and `__shutdown__` with an ack, then fires
    /// `__shutdown_complete__` shortly after.
    struct CooperativeWorker {
        peer: Channel,
    }

    #[async_trait]
    impl RequestHandler for CooperativeWorker {
        async fn handle(&self, method: &str, _params: Option<Value>) -> std::result::Result<Value, ErrorObject> {
            if method == reserved::SHUTDOWN {
                let peer = self.peer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = peer.notify(reserved::SHUTDOWN_COMPLETE, Some(json!({ "exit_code": 0 }))).await;
                });
                Ok(json!({ "acknowledged": true, "pending_requests": 0u64 }))
            } else {
                Err(ErrorObject { code: -32601, message: "no such method".into(), data: None })
            }
        }
    }

    async fn spawn_sleeper(seconds: &str) -> tokio::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(format!("sleep {seconds}"))
            .spawn()
            .expect("spawn sleeper")
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn drives_heartbeat_and_graceful_shutdown_end_to_end() {
        let (left, right) = make_pair();
        right.on_request(Arc::new(CooperativeWorker { peer: right.clone() })).await;

        let pong_echoer = Arc::new(NotificationRouter::new());
        pong_echoer.on(reserved::HEARTBEAT_PING, {
            let right = right.clone();
            Arc::new(move |params: Option<Value>| {
                let right = right.clone();
                let seq = params.as_ref().and_then(|p| p.get("seq")).cloned().unwrap_or(json!(0));
                tokio::spawn(async move {
                    let _ = right.notify(reserved::HEARTBEAT_PONG, Some(json!({ "seq": seq }))).await;
                });
            })
        });
        right.on_notification(pong_echoer as Arc<dyn NotificationHandler>).await;

        left.start().await.unwrap();
        right.start().await.unwrap();

        let child = spawn_sleeper("0.3").await;
        let pid = child.id().unwrap();
        let handle = Arc::new(ProcessHandle::new(WorkerId::new("w").unwrap(), pid, left, child));
        handle.set_state(ProcessState::Running);

        let resilient = Resilient::new(
            handle,
            HeartbeatConfig {
                interval: Duration::from_millis(30),
                timeout: Duration::from_millis(200),
                max_missed: 3,
                implicit_heartbeat: true,
            },
            ShutdownConfig {
                graceful_timeout: Duration::from_secs(2),
                exit_wait: Duration::from_millis(20),
            },
        )
        .await;

        let mut heartbeat_events = resilient.heartbeat_events();
        let saw_pong = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let HeartbeatEvent::Pong { .. } = heartbeat_events.recv().await.unwrap() {
                    return true;
                }
            }
        })
        .await
        .unwrap_or(false);
        assert!(saw_pong, "expected at least one pong over the composed channel");

        let mut shutdown_events = resilient.shutdown_events();
        resilient.shutdown(ShutdownReason::UserRequested).await.unwrap();

        let mut saw_graceful_done = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(200), shutdown_events.recv()).await {
            if let ShutdownEvent::Done { graceful, .. } = event {
                saw_graceful_done = graceful;
            }
        }
        assert!(saw_graceful_done, "expected the composed shutdown to complete gracefully");
    }
}
