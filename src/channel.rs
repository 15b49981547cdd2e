//! Channel (C5): the central request/response/notification multiplexer.
//!
//! One spawned task owns the transport, the framing buffer, and all mutable
//! dispatch state for the lifetime of the channel — the "single logical
//! critical section per channel" the concurrency model (§5) requires. Callers
//! reach that state only through message passing (`write_tx`, the pending-call
//! table) or a mutex around the rarely-contended handler slots.
//!
//! Grounded on the teacher's accept/read loop shape
//! (`examples/redhat-performance-rusty-comms/src/ipc/unix_domain_socket.rs::handle_connection`),
//! generalized from "forward every message to an mpsc channel" into a full
//! request-id-correlated multiplexer, the way
//! `examples/other_examples/1a7b861f_CambrianTech-continuum__...-ipc-mod.rs.rs` correlates
//! out-of-order responses by `request_id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::Codec;
use crate::error::{CoreError, Result};
use crate::framing::Framing;
use crate::ids::{RequestId, RequestIdGenerator};
use crate::protocol::{
    self, create_error_response, create_notification, create_request, create_response,
    ErrorObject, Parsed,
};
use crate::transport::Transport;

/// Handles a decoded request envelope and produces its result (or a peer error).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Option<Value>) -> std::result::Result<Value, ErrorObject>;
}

/// Handles a decoded notification envelope. Synchronous: notification handling in
/// this core is limited to cheap internal routing (heartbeat pongs, shutdown
/// signals) and must never block the channel's single reactor task.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, method: &str, params: Option<Value>);
}

/// Routes notifications to per-method callbacks by name.
///
/// A channel has only one notification-handler slot, but internal consumers
/// (data-channel-ready signalling at spawn time, the heartbeat pong and
/// shutdown-complete routing `Resilient` installs later) each care about a
/// disjoint set of reserved methods — this lets several independent pieces of
/// internal machinery share that one slot over the channel's lifetime.
#[derive(Default)]
pub struct NotificationRouter {
    routes: std::sync::Mutex<HashMap<String, Arc<dyn Fn(Option<Value>) + Send + Sync>>>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self {
            routes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn on(&self, method: impl Into<String>, handler: Arc<dyn Fn(Option<Value>) + Send + Sync>) {
        self.routes.lock().unwrap().insert(method.into(), handler);
    }
}

impl NotificationHandler for NotificationRouter {
    fn handle(&self, method: &str, params: Option<Value>) {
        let handler = self.routes.lock().unwrap().get(method).cloned();
        if let Some(handler) = handler {
            handler(params);
        }
    }
}

struct PendingCall {
    resolver: oneshot::Sender<std::result::Result<Value, CoreError>>,
}

struct Reactor {
    transport: Box<dyn Transport>,
    framing: Box<dyn Framing>,
    write_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

struct Inner {
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<HashMap<RequestId, PendingCall>>,
    id_gen: RequestIdGenerator,
    closed: AtomicBool,
    codec: Arc<dyn Codec>,
    request_handler: Mutex<Option<Arc<dyn RequestHandler>>>,
    notification_handler: Mutex<Option<Arc<dyn NotificationHandler>>>,
    activity_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    reactor: Mutex<Option<Reactor>>,
    task: Mutex<Option<JoinHandle<()>>>,
    label: String,
}

/// A cheaply-cloned handle to one channel. All clones share the same reactor task
/// and pending-call table.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl Channel {
    /// Builds a channel over `transport`, using `framing` for message boundaries
    /// and `codec` to decode/encode the boundary-delimited payloads. `label` is
    /// used only in log lines and error messages (e.g. `"worker-1/control"`).
    pub fn new(
        transport: Box<dyn Transport>,
        framing: Box<dyn Framing>,
        codec: Arc<dyn Codec>,
        label: impl Into<String>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            write_tx,
            pending: Mutex::new(HashMap::new()),
            id_gen: RequestIdGenerator::new(),
            closed: AtomicBool::new(false),
            codec,
            request_handler: Mutex::new(None),
            notification_handler: Mutex::new(None),
            activity_hook: Mutex::new(None),
            reactor: Mutex::new(Some(Reactor {
                transport,
                framing,
                write_rx,
            })),
            task: Mutex::new(None),
            label: label.into(),
        });
        Self { inner }
    }

    /// Registers `handler` for decoded requests, replacing any previous handler.
    pub async fn on_request(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.request_handler.lock().await = Some(handler);
    }

    /// Registers `handler` for decoded notifications, replacing any previous handler.
    pub async fn on_notification(&self, handler: Arc<dyn NotificationHandler>) {
        *self.inner.notification_handler.lock().await = Some(handler);
    }

    /// Registers a hook invoked on every successful inbound frame (implicit
    /// heartbeat activity, §4.8/§9).
    pub async fn on_activity(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.activity_hook.lock().await = Some(hook);
    }

    /// Starts the inbound loop. Errors with [`CoreError::AlreadyStarted`] if
    /// called twice.
    /// The label this channel was constructed with (e.g. `"worker-1/control"`).
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub async fn start(&self) -> Result<()> {
        let mut reactor_guard = self.inner.reactor.lock().await;
        let reactor = reactor_guard.take().ok_or(CoreError::AlreadyStarted)?;
        drop(reactor_guard);

        let inner = self.inner.clone();
        let task = tokio::spawn(run_reactor(inner, reactor));
        *self.inner.task.lock().await = Some(task);
        Ok(())
    }

    /// Stops the inbound loop and rejects every pending call with
    /// [`CoreError::Closed`]. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.inner.task.lock().await.take() {
            task.abort();
        }
        reject_all_pending(&self.inner, CoreError::Closed).await;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sends a request and awaits its response, or a peer error, or a timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if method.is_empty() {
            return Err(CoreError::Protocol("method must be non-empty".into()));
        }
        if self.is_closed() {
            return Err(CoreError::Closed);
        }

        let id = self.inner.id_gen.next();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(id, PendingCall { resolver: tx });

        let envelope = create_request(method, params, id);
        if let Err(e) = self.send_envelope(&envelope).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        match timeout {
            Some(d) => match tokio::time::timeout(d, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(CoreError::Closed),
                Err(_) => {
                    self.inner.pending.lock().await.remove(&id);
                    Err(CoreError::Timeout)
                }
            },
            None => rx.await.map_err(|_| CoreError::Closed)?,
        }
    }

    /// Sends a notification. Returns once the bytes are enqueued for write.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let envelope = create_notification(method, params);
        self.send_envelope(&envelope).await
    }

    async fn send_envelope(&self, envelope: &protocol::Envelope) -> Result<()> {
        let value = serde_json::to_value(envelope).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let payload = self.inner.codec.encode(&value)?;
        self.inner
            .write_tx
            .send(payload)
            .map_err(|_| CoreError::Closed)
    }
}

async fn reject_all_pending(inner: &Inner, err: CoreError) {
    let mut pending = inner.pending.lock().await;
    for (_, call) in pending.drain() {
        let _ = call.resolver.send(Err(clone_error(&err)));
    }
}

fn clone_error(err: &CoreError) -> CoreError {
    match err {
        CoreError::Closed => CoreError::Closed,
        CoreError::Timeout => CoreError::Timeout,
        other => CoreError::Protocol(other.to_string()),
    }
}

async fn run_reactor(inner: Arc<Inner>, mut reactor: Reactor) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            biased;
            maybe_bytes = reactor.write_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        let wire = reactor.framing.encode(&bytes);
                        if let Err(e) = reactor.transport.write_all(&wire).await {
                            warn!(channel = %inner.label, "write failed: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }
            read_result = reactor.transport.read(&mut buf) => {
                match read_result {
                    Ok(0) => {
                        debug!(channel = %inner.label, "transport EOF");
                        break;
                    }
                    Ok(n) => {
                        reactor.framing.feed(&buf[..n]);
                        if !drain_frames(&inner, &mut reactor).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(channel = %inner.label, "read failed: {e}");
                        break;
                    }
                }
            }
        }
    }
    let _ = reactor.transport.disconnect().await;
    inner.closed.store(true, Ordering::SeqCst);
    reject_all_pending(&inner, CoreError::Closed).await;
}

/// Drains every complete frame currently buffered. Returns `false` if a
/// framing error occurred (fatal to the channel per §7).
async fn drain_frames(inner: &Arc<Inner>, reactor: &mut Reactor) -> bool {
    loop {
        match reactor.framing.next_frame() {
            Ok(Some(frame)) => dispatch_frame(inner, frame).await,
            Ok(None) => {
                if reactor.framing.buffered_len() == 0 {
                    reactor.transport.note_drained();
                }
                return true;
            }
            Err(e) => {
                warn!(channel = %inner.label, "framing error: {e}");
                return false;
            }
        }
    }
}

async fn dispatch_frame(inner: &Arc<Inner>, frame: Vec<u8>) {
    let value = match inner.codec.decode(&frame) {
        Ok(v) => v,
        Err(e) => {
            trace!(channel = %inner.label, "dropping undecodable frame: {e}");
            return;
        }
    };

    if let Some(hook) = inner.activity_hook.lock().await.clone() {
        hook();
    }

    match protocol::parse(value) {
        Parsed::Response(envelope) => {
            let id = match envelope.id {
                Some(id) => id,
                None => return,
            };
            let resolver = inner.pending.lock().await.remove(&id);
            if let Some(call) = resolver {
                let outcome = if let Some(result) = envelope.result {
                    Ok(result)
                } else if let Some(err) = envelope.error {
                    Err(CoreError::Peer {
                        code: err.code,
                        message: err.message,
                        data: err.data,
                    })
                } else {
                    Err(CoreError::Protocol("malformed response".into()))
                };
                let _ = call.resolver.send(outcome);
            }
        }
        Parsed::Request(envelope) => handle_inbound_request(inner, envelope).await,
        Parsed::Notification(envelope) => {
            if let Some(handler) = inner.notification_handler.lock().await.clone() {
                handler.handle(envelope.method.as_deref().unwrap_or(""), envelope.params);
            }
        }
        Parsed::Invalid { raw, reason } => {
            trace!(channel = %inner.label, %reason, "invalid envelope: {raw}");
            if let Some(id) = raw.get("id").and_then(|v| v.as_u64()) {
                let error = ErrorObject {
                    code: -32600,
                    message: format!("invalid request: {reason}"),
                    data: None,
                };
                let response = create_error_response(id, error);
                if let Ok(value) = serde_json::to_value(&response) {
                    if let Ok(bytes) = inner.codec.encode(&value) {
                        let _ = inner.write_tx.send(bytes);
                    }
                }
            }
        }
    }
}


async fn handle_inbound_request(inner: &Arc<Inner>, envelope: protocol::Envelope) {
    let id = envelope.id.unwrap();
    let method = envelope.method.unwrap_or_default();
    let handler = inner.request_handler.lock().await.clone();

    let response = match handler {
        Some(h) => match h.handle(&method, envelope.params).await {
            Ok(result) => create_response(id, result),
            Err(err) => create_error_response(id, err),
        },
        None => create_error_response(
            id,
            ErrorObject {
                code: -32601,
                message: format!("no handler registered for method {method:?}"),
                data: None,
            },
        ),
    };

    if let Ok(value) = serde_json::to_value(&response) {
        if let Ok(bytes) = inner.codec.encode(&value) {
            let _ = inner.write_tx.send(bytes);
        }
    }
}
