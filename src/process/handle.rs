//! ProcessHandle (C6): the caller-facing object for one supervised worker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};

use super::ProcessState;
use crate::channel::Channel;
use crate::error::{CoreError, Result};
use crate::events::EventBus;
use crate::ids::WorkerId;

/// Events on [`ProcessHandle`]'s own stream, distinct from [`super::ManagerEvent`]
/// (§4.6 "event stream `{stateChange, exit, error}`").
#[derive(Debug, Clone)]
pub enum HandleEvent {
    StateChange(ProcessState),
    Exit { code: Option<i32> },
    Error(String),
}

/// One live (or formerly-live) worker. Outlives the [`super::ProcessManager`] entry
/// it was created from once detached — existing `Arc<ProcessHandle>` clones held by
/// callers keep working, they just observe a terminal state.
pub struct ProcessHandle {
    id: WorkerId,
    pid: AtomicU32,
    state_tx: watch::Sender<ProcessState>,
    control_channel: Channel,
    data_channel: Mutex<Option<Channel>>,
    child: Mutex<Option<tokio::process::Child>>,
    events: EventBus<HandleEvent>,
}

impl ProcessHandle {
    pub(crate) fn new(id: WorkerId, pid: u32, control_channel: Channel, child: tokio::process::Child) -> Self {
        let (state_tx, _rx) = watch::channel(ProcessState::Spawning);
        Self {
            id,
            pid: AtomicU32::new(pid),
            state_tx,
            control_channel,
            data_channel: Mutex::new(None),
            child: Mutex::new(Some(child)),
            events: EventBus::new(),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ProcessState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions, e.g. to await a terminal state without polling.
    pub(crate) fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state_tx.subscribe()
    }

    pub fn control_channel(&self) -> &Channel {
        &self.control_channel
    }

    pub async fn has_data_channel(&self) -> bool {
        self.data_channel.lock().await.is_some()
    }

    pub fn events(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }

    pub(crate) async fn attach_data_channel(&self, channel: Channel) {
        *self.data_channel.lock().await = Some(channel);
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        let _ = self.state_tx.send(state);
        self.events.publish(HandleEvent::StateChange(state));
    }

    pub(crate) fn emit_exit(&self, code: Option<i32>) {
        self.events.publish(HandleEvent::Exit { code });
    }

    pub(crate) fn emit_error(&self, message: impl Into<String>) {
        self.events.publish(HandleEvent::Error(message.into()));
    }

    pub(crate) async fn take_child(&self) -> Option<tokio::process::Child> {
        self.child.lock().await.take()
    }

    fn require_running(&self) -> Result<()> {
        if self.state() != ProcessState::Running {
            return Err(CoreError::NotRunning);
        }
        Ok(())
    }

    /// Sends a request over the control channel.
    pub async fn request(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        self.require_running()?;
        self.control_channel.request(method, params, timeout).await
    }

    /// Sends a notification over the control channel.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.require_running()?;
        self.control_channel.notify(method, params).await
    }

    /// Sends a request over the data channel. Fails with
    /// [`CoreError::DataChannelDisabled`] if one was not enabled at spawn.
    pub async fn request_via_data(&self, method: &str, params: Option<Value>, timeout: Option<Duration>) -> Result<Value> {
        self.require_running()?;
        let guard = self.data_channel.lock().await;
        let channel = guard.as_ref().ok_or(CoreError::DataChannelDisabled)?;
        channel.request(method, params, timeout).await
    }

    /// Tears down channels and transports. Does not terminate the child process —
    /// that is [`super::ProcessManager::terminate`]'s job.
    pub async fn close(&self) -> Result<()> {
        self.control_channel.close().await?;
        if let Some(data) = self.data_channel.lock().await.as_ref() {
            data.close().await?;
        }
        Ok(())
    }
}

/// A shareable handle, cheap to clone and hand to application callers.
pub type SharedHandle = Arc<ProcessHandle>;
