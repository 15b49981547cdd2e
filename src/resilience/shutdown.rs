//! ShutdownManager (C10): multi-phase graceful shutdown with a force-kill
//! escalation path (§4.10).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::process::ProcessHandle;
use crate::protocol::reserved;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    SendingRequest,
    AwaitingAck,
    Draining,
    AwaitingComplete,
    Completed,
    ForceKilling,
}

/// Why a shutdown was initiated; serialized on the wire as the matching
/// snake_case string (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    UserRequested,
    ManagerShutdown,
    IdleTimeout,
    ErrorThreshold,
    Restart,
    HeartbeatDead,
}

impl ShutdownReason {
    fn wire_str(self) -> &'static str {
        match self {
            ShutdownReason::UserRequested => "user_requested",
            ShutdownReason::ManagerShutdown => "manager_shutdown",
            ShutdownReason::IdleTimeout => "idle_timeout",
            ShutdownReason::ErrorThreshold => "error_threshold",
            ShutdownReason::Restart => "restart",
            ShutdownReason::HeartbeatDead => "heartbeat_dead",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub graceful_timeout: Duration,
    pub exit_wait: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            exit_wait: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ShutdownEvent {
    Start { reason: &'static str },
    Ack { pending_requests: u64 },
    Complete { exit_code: i32 },
    Force { reason: String },
    Done { graceful: bool, duration_ms: u64 },
    Error { message: String },
}

/// Bridges the synchronous `__shutdown_complete__` notification callback to an
/// async waiter, the same `Notify` + `Mutex<Option<_>>` shape
/// [`crate::process::manager`]'s data-channel waiter uses.
struct CompleteWaiter {
    notify: tokio::sync::Notify,
    outcome: std::sync::Mutex<Option<i32>>,
}

impl CompleteWaiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            notify: tokio::sync::Notify::new(),
            outcome: std::sync::Mutex::new(None),
        })
    }

    fn signal(&self, exit_code: i32) {
        *self.outcome.lock().unwrap() = Some(exit_code);
        self.notify.notify_waiters();
    }

    async fn wait(&self, timeout: Duration) -> Option<i32> {
        if let Some(code) = *self.outcome.lock().unwrap() {
            return Some(code);
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => *self.outcome.lock().unwrap(),
            _ = tokio::time::sleep(timeout) => None,
        }
    }
}

/// Drives one worker's shutdown: a polite `__shutdown__` request, an await on
/// `__shutdown_complete__`, and a SIGKILL escalation if either step stalls
/// past `graceful_timeout`.
pub struct ShutdownManager {
    handle: Arc<ProcessHandle>,
    config: ShutdownConfig,
    waiter: Arc<CompleteWaiter>,
    events: EventBus<ShutdownEvent>,
    done: AtomicBool,
}

impl ShutdownManager {
    pub fn new(handle: Arc<ProcessHandle>, config: ShutdownConfig) -> Arc<Self> {
        Arc::new(Self {
            handle,
            config,
            waiter: CompleteWaiter::new(),
            events: EventBus::new(),
            done: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<ShutdownEvent> {
        self.events.subscribe()
    }

    /// Callback installed on the control channel's [`crate::channel::NotificationRouter`]
    /// for [`reserved::SHUTDOWN_COMPLETE`].
    pub(crate) fn handle_complete(&self, params: Option<Value>) {
        let code = params
            .as_ref()
            .and_then(|p| p.get("exit_code"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0) as i32;
        self.waiter.signal(code);
    }

    /// Runs the full shutdown sequence. Idempotent: calling this again on an
    /// already-completed manager returns immediately (§8 round-trip invariant).
    pub async fn initiate(self: &Arc<Self>, reason: ShutdownReason) -> Result<()> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let start = Instant::now();
        self.events.publish(ShutdownEvent::Start {
            reason: reason.wire_str(),
        });

        let budget = self.config.graceful_timeout;
        let remaining = |elapsed: Duration| budget.saturating_sub(elapsed);

        let ack = self
            .handle
            .request(
                reserved::SHUTDOWN,
                Some(json!({ "timeout_ms": budget.as_millis() as u64, "reason": reason.wire_str() })),
                Some(budget),
            )
            .await;

        let ack = match ack {
            Ok(v) => v,
            Err(e) => {
                self.events.publish(ShutdownEvent::Error { message: e.to_string() });
                return self.force_kill(reason, start).await;
            }
        };

        let pending_requests = ack.get("pending_requests").and_then(|v| v.as_u64()).unwrap_or(0);
        self.events.publish(ShutdownEvent::Ack { pending_requests });

        let wait_budget = remaining(start.elapsed());
        match self.waiter.wait(wait_budget).await {
            Some(exit_code) => {
                self.events.publish(ShutdownEvent::Complete { exit_code });
                let settle = self.config.exit_wait.min(remaining(start.elapsed()));
                tokio::time::sleep(settle).await;
                self.events.publish(ShutdownEvent::Done {
                    graceful: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                Ok(())
            }
            None => self.force_kill(reason, start).await,
        }
    }

    async fn force_kill(&self, reason: ShutdownReason, start: Instant) -> Result<()> {
        self.events.publish(ShutdownEvent::Force {
            reason: reason.wire_str().to_string(),
        });

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let pid = Pid::from_raw(self.handle.pid() as i32);
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                self.events.publish(ShutdownEvent::Error { message: e.to_string() });
                return Err(CoreError::Shutdown(e.to_string()));
            }
        }

        self.events.publish(ShutdownEvent::Done {
            graceful: false,
            duration_ms: start.elapsed().as_millis() as u64,
        });
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::{Channel, RequestHandler};
    use crate::codec::JsonCodec;
    use crate::framing::LineFraming;
    use crate::ids::WorkerId;
    use crate::process::ProcessState;
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
                .map_err(|e| CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.0
                .read(buf)
                .await
                .map_err(|e| CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
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

    async fn spawn_sleeper(seconds: &str) -> tokio::process::Child {
        Command::new("sh")
            .arg("-c")
            .arg(format!("sleep {seconds}"))
            .spawn()
            .expect("spawn sleeper")
    }

    struct AckingWorker;

    #[async_trait]
    impl RequestHandler for AckingWorker {
        async fn handle(&self, method: &str, _params: Option<Value>) -> std::result::Result<Value, ErrorObject> {
            if method == reserved::SHUTDOWN {
                Ok(json!({ "acknowledged": true, "pending_requests": 2u64 }))
            } else {
                Err(ErrorObject { code: -32601, message: "no such method".into(), data: None })
            }
        }
    }

    #[tokio::test]
    async fn cooperative_worker_completes_gracefully() {
        let (left, right) = make_pair();
        right.on_request(Arc::new(AckingWorker)).await;
        left.start().await.unwrap();
        right.start().await.unwrap();

        let child = spawn_sleeper("0.2").await;
        let pid = child.id().unwrap();
        let handle = Arc::new(ProcessHandle::new(WorkerId::new("w").unwrap(), pid, left, child));
        handle.set_state(ProcessState::Running);

        let manager = ShutdownManager::new(
            handle.clone(),
            ShutdownConfig { graceful_timeout: Duration::from_secs(2), exit_wait: Duration::from_millis(20) },
        );
        let mut events = manager.events();

        let complete_manager = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            complete_manager.handle_complete(Some(json!({ "exit_code": 0 })));
        });

        manager.initiate(ShutdownReason::UserRequested).await.unwrap();

        let mut saw_ack = false;
        let mut saw_done_graceful = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            match event {
                ShutdownEvent::Ack { pending_requests } => {
                    assert_eq!(pending_requests, 2);
                    saw_ack = true;
                }
                ShutdownEvent::Done { graceful, .. } => saw_done_graceful = graceful,
                _ => {}
            }
        }
        assert!(saw_ack);
        assert!(saw_done_graceful);
    }

    #[tokio::test]
    async fn unresponsive_worker_escalates_to_force_kill() {
        let (left, _right) = make_pair();
        // `_right` never registers a request handler, so `__shutdown__` times out.
        left.start().await.unwrap();

        let child = spawn_sleeper("5").await;
        let pid = child.id().unwrap();
        let handle = Arc::new(ProcessHandle::new(WorkerId::new("w").unwrap(), pid, left, child));
        handle.set_state(ProcessState::Running);

        let manager = ShutdownManager::new(
            handle.clone(),
            ShutdownConfig { graceful_timeout: Duration::from_millis(50), exit_wait: Duration::from_millis(10) },
        );
        let mut events = manager.events();

        manager.initiate(ShutdownReason::UserRequested).await.unwrap();

        let mut saw_force = false;
        let mut saw_done_forced = false;
        while let Ok(Ok(event)) = tokio::time::timeout(Duration::from_millis(100), events.recv()).await {
            match event {
                ShutdownEvent::Force { .. } => saw_force = true,
                ShutdownEvent::Done { graceful, .. } => saw_done_forced = !graceful,
                _ => {}
            }
        }
        assert!(saw_force, "expected force-kill escalation");
        assert!(saw_done_forced);

        if let Some(mut original) = handle.take_child().await {
            let status = tokio::time::timeout(Duration::from_secs(2), original.wait()).await;
            assert!(status.is_ok(), "killed child should exit promptly");
        }
    }
}
