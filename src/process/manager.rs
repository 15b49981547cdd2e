//! ProcessManager (C7): registry, spawn/terminate orchestration, restart policy.
//!
//! Grounded on the teacher's `coordination.rs::HostCoordinator` (`server_processes:
//! Arc<Mutex<HashMap<ProcessId, ServerProcess>>>`) for the registry shape, generalized
//! from a one-shot benchmark spawn into spawn-with-retry, handshake, optional
//! data-channel attach, and restart-on-crash per §4.7.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{error, warn};

use super::handle::ProcessHandle;
use super::restart::{backoff_delay, RestartBookkeeping};
use super::{ProcessState, SpawnOptions};
use crate::channel::{Channel, NotificationRouter};
use crate::codec::{Codec, JsonCodec};
use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::framing::{LengthPrefixedFraming, LineFraming};
use crate::ids::WorkerId;
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::protocol::reserved;
use crate::transport::{SocketClient, StdioChild, Transport};

const SPAWN_MAX_RETRIES: u32 = 3;
const SPAWN_RETRY_BASE_MS: u64 = 1_000;
const SPAWN_RETRY_MAX_MS: u64 = 30_000;

/// Events on the manager's own stream (§4.7 "event stream").
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Spawn { id: WorkerId },
    Ready { id: WorkerId },
    Exit { id: WorkerId, code: Option<i32> },
    Crash { id: WorkerId, cause: String },
    Restart { id: WorkerId, attempt: u32, delay_ms: u64 },
    Error { id: WorkerId, message: String },
}

struct Entry {
    handle: Arc<ProcessHandle>,
    shutting_down: Arc<AtomicBool>,
    /// Data-channel socket path generated for this worker, if any (§5 "Shared
    /// resources": the supervisor, not the transport, unlinks it on termination).
    data_path: Option<PathBuf>,
}

/// One-shot signal bridging the notification-handler callback (sync, fires on the
/// channel's reactor task) to the async spawn sequence awaiting
/// `__data_channel_ready__` / `__data_channel_error__` (§4.7 step 5).
struct DataChannelWaiter {
    notify: tokio::sync::Notify,
    outcome: std::sync::Mutex<Option<std::result::Result<(), String>>>,
}

impl DataChannelWaiter {
    fn new() -> Self {
        Self {
            notify: tokio::sync::Notify::new(),
            outcome: std::sync::Mutex::new(None),
        }
    }

    fn signal(&self, outcome: std::result::Result<(), String>) {
        *self.outcome.lock().unwrap() = Some(outcome);
        self.notify.notify_one();
    }

    async fn wait(&self, timeout: std::time::Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.notify.notified())
            .await
            .map_err(|_| CoreError::Timeout)?;
        match self.outcome.lock().unwrap().take() {
            Some(Ok(())) => Ok(()),
            Some(Err(message)) => Err(CoreError::Transport {
                endpoint: "data-channel".into(),
                cause: message,
            }),
            None => Err(CoreError::Protocol("data channel waiter signalled with no outcome".into())),
        }
    }
}

/// Registry keyed by worker id; orchestrates spawn, handshake, restart-on-crash,
/// and termination.
pub struct ProcessManager {
    namespace: String,
    data_dir: PathBuf,
    registry: Mutex<HashMap<WorkerId, Entry>>,
    events: EventBus<ManagerEvent>,
    codec: Arc<dyn Codec>,
    metrics: Arc<dyn MetricsSink>,
}

impl ProcessManager {
    /// `namespace` prefixes environment variables (`<NS>_MODULE_NAME`, `<NS>_DATA_PATH`)
    /// and generated data-channel socket file names. `data_dir` must be a directory the
    /// supervisor can write Unix domain socket files into.
    pub fn new(namespace: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace: namespace.into(),
            data_dir: data_dir.into(),
            registry: Mutex::new(HashMap::new()),
            events: EventBus::new(),
            codec: Arc::new(JsonCodec),
            metrics: Arc::new(NoopMetricsSink),
        }
    }

    /// Wires a metrics sink; the manager reports spawns, restarts, and crashes
    /// through it as they happen. Defaults to [`NoopMetricsSink`].
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn events(&self) -> tokio::sync::broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    pub async fn get_handle(&self, id: &WorkerId) -> Option<Arc<ProcessHandle>> {
        self.registry.lock().await.get(id).map(|e| e.handle.clone())
    }

    pub async fn is_running(&self, id: &WorkerId) -> bool {
        matches!(
            self.registry.lock().await.get(id).map(|e| e.handle.state()),
            Some(ProcessState::Running)
        )
    }

    /// Spawns a worker under `id`. Rejects if `id` is already registered in a
    /// non-stopped, non-crashed state.
    pub async fn spawn(self: &Arc<Self>, id: WorkerId, opts: SpawnOptions) -> Result<Arc<ProcessHandle>> {
        {
            let registry = self.registry.lock().await;
            if let Some(entry) = registry.get(&id) {
                if !matches!(entry.handle.state(), ProcessState::Stopped | ProcessState::Crashed) {
                    return Err(CoreError::DuplicateWorker(id));
                }
            }
        }

        let (handle, data_path) = match self.spawn_with_retry(&id, &opts).await {
            Ok(h) => h,
            Err(e) => {
                self.events.publish(ManagerEvent::Error {
                    id: id.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };
        self.events.publish(ManagerEvent::Spawn { id: id.clone() });
        self.metrics.worker_spawned(id.as_str());
        handle.set_state(ProcessState::Running);
        self.events.publish(ManagerEvent::Ready { id: id.clone() });

        let shutting_down = Arc::new(AtomicBool::new(false));
        self.registry.lock().await.insert(
            id.clone(),
            Entry {
                handle: handle.clone(),
                shutting_down: shutting_down.clone(),
                data_path,
            },
        );

        let manager = self.clone();
        let opts_for_task = opts;
        tokio::spawn(async move {
            manager.supervise(id, opts_for_task, shutting_down).await;
        });

        Ok(handle)
    }

    /// Spawn algorithm (§4.7 steps 1-6) wrapped in the spawn-retry loop.
    async fn spawn_with_retry(&self, id: &WorkerId, opts: &SpawnOptions) -> Result<(Arc<ProcessHandle>, Option<PathBuf>)> {
        let mut last_cause = String::new();
        for attempt in 1..=SPAWN_MAX_RETRIES.max(1) {
            match self.spawn_once(id, opts).await {
                Ok(handle_and_path) => return Ok(handle_and_path),
                Err(e) => {
                    warn!(worker = %id, attempt, "spawn attempt failed: {e}");
                    last_cause = e.to_string();
                    if attempt < SPAWN_MAX_RETRIES {
                        tokio::time::sleep(backoff_delay(attempt, SPAWN_RETRY_BASE_MS, SPAWN_RETRY_MAX_MS)).await;
                    }
                }
            }
        }
        Err(CoreError::Spawn {
            worker_id: id.clone(),
            attempts: SPAWN_MAX_RETRIES,
            last_cause,
        })
    }

    async fn spawn_once(&self, id: &WorkerId, opts: &SpawnOptions) -> Result<(Arc<ProcessHandle>, Option<PathBuf>)> {
        let data_path = if opts.data_channel.enabled {
            Some(self.generate_data_path(id))
        } else {
            None
        };

        let mut command = Command::new(&opts.program);
        command
            .args(&opts.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }
        for (k, v) in &opts.env {
            command.env(k, v);
        }
        command.env(format!("{}_MODULE_NAME", self.namespace), id.as_str());
        if let Some(path) = &data_path {
            command.env(format!("{}_DATA_PATH", self.namespace), path);
        }

        let mut child = command.spawn().map_err(|e| CoreError::Spawn {
            worker_id: id.clone(),
            attempts: 1,
            last_cause: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| CoreError::Spawn {
            worker_id: id.clone(),
            attempts: 1,
            last_cause: "child exited before pid was observable".into(),
        })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let transport = Box::new(StdioChild::with_buffer_bounds(
            id.clone(),
            pid,
            stdin,
            stdout,
            stderr,
            opts.max_stdout_buffer,
            opts.max_stderr_buffer,
        ));
        let control_channel = Channel::new(
            transport,
            Box::new(LineFraming::default()),
            self.codec.clone(),
            format!("{id}/control"),
        );

        self.start_channel(&control_channel, id, "connect control transport").await?;

        let data_ready = Arc::new(DataChannelWaiter::new());
        let router = Arc::new(NotificationRouter::new());
        router.on(reserved::DATA_CHANNEL_READY, {
            let data_ready = data_ready.clone();
            Arc::new(move |_params: Option<Value>| data_ready.signal(Ok(())))
        });
        router.on(reserved::DATA_CHANNEL_ERROR, {
            let data_ready = data_ready.clone();
            Arc::new(move |params: Option<Value>| {
                let message = params
                    .and_then(|p| p.get("message").and_then(|m| m.as_str().map(String::from)))
                    .unwrap_or_else(|| "data channel error".into());
                data_ready.signal(Err(message));
            })
        });
        control_channel
            .on_notification(router as Arc<dyn crate::channel::NotificationHandler>)
            .await;

        let handshake_result = control_channel
            .request(
                reserved::HANDSHAKE,
                Some(json!({ "protocol_version": crate::protocol::PROTOCOL_VERSION })),
                Some(opts.handshake_timeout),
            )
            .await;
        if let Err(e) = handshake_result {
            let _ = control_channel.close().await;
            return Err(CoreError::Spawn {
                worker_id: id.clone(),
                attempts: 1,
                last_cause: format!("handshake failed: {e}"),
            });
        }

        let handle = Arc::new(ProcessHandle::new(id.clone(), pid, control_channel, child));

        if let Some(path) = &data_path {
            if let Err(e) = data_ready.wait(opts.handshake_timeout).await {
                let _ = handle.close().await;
                return Err(CoreError::Spawn {
                    worker_id: id.clone(),
                    attempts: 1,
                    last_cause: format!("data channel never became ready: {e}"),
                });
            }
            let mut client = SocketClient::new(path.clone());
            if let Err(e) = client.connect().await {
                let _ = handle.close().await;
                return Err(CoreError::Spawn {
                    worker_id: id.clone(),
                    attempts: 1,
                    last_cause: format!("data channel connect failed: {e}"),
                });
            }
            let data_channel = Channel::new(
                Box::new(client),
                Box::new(LengthPrefixedFraming::new(opts.data_channel.max_frame_size)),
                self.codec.clone(),
                format!("{id}/data"),
            );
            self.start_channel(&data_channel, id, "connect data transport").await?;
            handle.attach_data_channel(data_channel).await;
        }

        Ok((handle, data_path))
    }

    async fn start_channel(&self, channel: &Channel, id: &WorkerId, what: &str) -> Result<()> {
        channel.start().await.map_err(|e| CoreError::Spawn {
            worker_id: id.clone(),
            attempts: 1,
            last_cause: format!("{what}: {e}"),
        })
    }

    fn generate_data_path(&self, id: &WorkerId) -> PathBuf {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        self.data_dir.join(format!("{}-{}-{}.sock", self.namespace, id.as_str(), suffix))
    }

    /// Watches a spawned child to completion, applying restart-on-crash policy,
    /// and respawns in place under the same id for as long as the policy allows.
    async fn supervise(self: Arc<Self>, id: WorkerId, opts: SpawnOptions, shutting_down: Arc<AtomicBool>) {
        let current_opts = opts;
        let mut bookkeeping = RestartBookkeeping::new();

        loop {
            let handle = match self.get_handle(&id).await {
                Some(h) => h,
                None => return,
            };
            let child = handle.take_child().await;
            let status = match child {
                Some(mut child) => child.wait().await.ok(),
                None => None,
            };
            let code = status.and_then(|s| exit_code(&s));
            handle.emit_exit(code);
            self.events.publish(ManagerEvent::Exit { id: id.clone(), code });

            if shutting_down.load(Ordering::SeqCst) {
                handle.set_state(ProcessState::Stopped);
                return;
            }

            if code == Some(0) {
                handle.set_state(ProcessState::Stopped);
                return;
            }

            if !current_opts.restart_policy.enabled {
                handle.set_state(ProcessState::Crashed);
                self.metrics.worker_crashed(id.as_str());
                self.events.publish(ManagerEvent::Crash {
                    id: id.clone(),
                    cause: format!("worker exited with code {code:?}"),
                });
                return;
            }

            let attempt = bookkeeping.try_record(Instant::now(), &current_opts.restart_policy);
            let attempt = match attempt {
                Some(a) => a,
                None => {
                    handle.set_state(ProcessState::Crashed);
                    self.metrics.worker_crashed(id.as_str());
                    self.events.publish(ManagerEvent::Crash {
                        id: id.clone(),
                        cause: "restart budget exhausted".into(),
                    });
                    return;
                }
            };

            let delay = backoff_delay(
                attempt,
                current_opts.restart_policy.backoff_ms,
                current_opts.restart_policy.max_backoff_ms,
            );
            self.metrics.worker_restarted(id.as_str(), attempt);
            self.events.publish(ManagerEvent::Restart {
                id: id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;

            match self.spawn_with_retry(&id, &current_opts).await {
                Ok((new_handle, new_data_path)) => {
                    self.events.publish(ManagerEvent::Spawn { id: id.clone() });
                    self.metrics.worker_spawned(id.as_str());
                    new_handle.set_state(ProcessState::Running);
                    self.events.publish(ManagerEvent::Ready { id: id.clone() });
                    if let Some(entry) = self.registry.lock().await.get_mut(&id) {
                        entry.handle = new_handle;
                        entry.data_path = new_data_path;
                    }
                }
                Err(e) => {
                    error!(worker = %id, "restart respawn failed: {e}");
                    handle.set_state(ProcessState::Crashed);
                    self.metrics.worker_crashed(id.as_str());
                    self.events.publish(ManagerEvent::Crash {
                        id: id.clone(),
                        cause: e.to_string(),
                    });
                    return;
                }
            }
            // current_opts is reused verbatim on every respawn, per §4.7.
        }
    }

    /// Idempotent: terminating an already-stopped worker is a no-op. Unknown ids
    /// are an error.
    pub async fn terminate(&self, id: &WorkerId) -> Result<()> {
        let (handle, shutting_down, data_path) = {
            let registry = self.registry.lock().await;
            let entry = registry.get(id).ok_or_else(|| CoreError::UnknownWorker(id.clone()))?;
            (entry.handle.clone(), entry.shutting_down.clone(), entry.data_path.clone())
        };

        if matches!(handle.state(), ProcessState::Stopped | ProcessState::Crashed) {
            return Ok(());
        }

        shutting_down.store(true, Ordering::SeqCst);
        handle.set_state(ProcessState::Stopping);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(handle.pid() as i32), Signal::SIGTERM);
        }

        let mut rx = handle.watch_state();
        while !matches!(*rx.borrow(), ProcessState::Stopped | ProcessState::Crashed) {
            if rx.changed().await.is_err() {
                break;
            }
        }
        let _ = handle.close().await;

        if let Some(path) = data_path {
            // §5 "Shared resources": the supervisor owns the socket file's lifetime,
            // not the transport — `SocketClient` never unlinks what it connects to.
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(worker = %id, path = %path.display(), "failed to unlink data channel socket: {e}");
                }
            }
        }

        Ok(())
    }

    /// Terminates every registered worker in parallel.
    pub async fn terminate_all(self: &Arc<Self>) -> Result<()> {
        let ids: Vec<WorkerId> = self.registry.lock().await.keys().cloned().collect();
        let mut set = JoinSet::new();
        for id in ids {
            let manager = self.clone();
            set.spawn(async move { manager.terminate(&id).await });
        }
        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| CoreError::Shutdown(e.to_string()))??;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|s| -s))
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}
