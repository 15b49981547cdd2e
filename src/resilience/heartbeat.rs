//! HeartbeatManager (C8): periodic ping/pong liveness detection (§4.8).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::events::EventBus;
use crate::metrics::{MetricsSink, NoopMetricsSink};
use crate::protocol::reserved;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_missed: u32,
    pub implicit_heartbeat: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_missed: 3,
            implicit_heartbeat: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    Missed { seq: u32, missed_count: u32 },
    Pong { seq: u32, latency_ms: u64, load: Option<Value> },
    Dead,
    Recovered,
}

/// `HeartbeatState` (§3): at most one pending ping at a time, `seq` monotonic.
#[derive(Debug, Default)]
struct State {
    seq: u32,
    pending_ping: Option<(u32, Instant)>,
    last_pong_at: Option<Instant>,
    consecutive_missed: u32,
}

/// Drives pings on `channel` and reacts to pongs routed to it by
/// [`crate::resilience::Resilient`]. `handle_pong` and `handle_activity` run
/// synchronously on the channel's reactor task, so internal state is a plain
/// blocking mutex rather than an async one.
pub struct HeartbeatManager {
    channel: Channel,
    config: HeartbeatConfig,
    state: Mutex<State>,
    running: AtomicBool,
    events: EventBus<HeartbeatEvent>,
    metrics: Arc<dyn MetricsSink>,
}

impl HeartbeatManager {
    pub fn new(channel: Channel, config: HeartbeatConfig) -> Arc<Self> {
        Self::new_with_metrics(channel, config, Arc::new(NoopMetricsSink))
    }

    /// As [`Self::new`], but reporting missed pings through `metrics` as they happen.
    pub fn new_with_metrics(channel: Channel, config: HeartbeatConfig, metrics: Arc<dyn MetricsSink>) -> Arc<Self> {
        Arc::new(Self {
            channel,
            config,
            state: Mutex::new(State::default()),
            running: AtomicBool::new(false),
            events: EventBus::new(),
            metrics,
        })
    }

    pub fn events(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }

    /// Emits the first ping immediately, then one every `interval` (skipping a
    /// tick if a ping is still in flight).
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let me = self.clone();
        tokio::spawn(async move {
            me.send_ping().await;
            let mut ticker = tokio::time::interval(me.config.interval);
            ticker.tick().await; // interval fires immediately; already handled above
            loop {
                ticker.tick().await;
                if !me.running.load(Ordering::SeqCst) {
                    break;
                }
                let pending = me.state.lock().unwrap().pending_ping.is_some();
                if pending {
                    continue;
                }
                me.send_ping().await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Brings state back to initial; the next `start()` issues `seq=1`.
    pub fn reset(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.state.lock().unwrap() = State::default();
    }

    async fn send_ping(self: &Arc<Self>) {
        let seq = {
            let mut state = self.state.lock().unwrap();
            state.seq += 1;
            state.pending_ping = Some((state.seq, Instant::now()));
            state.seq
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        if self
            .channel
            .notify(reserved::HEARTBEAT_PING, Some(json!({ "timestamp": timestamp, "seq": seq })))
            .await
            .is_err()
        {
            return;
        }

        let me = self.clone();
        let timeout = self.config.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            me.on_ping_timeout(seq);
        });
    }

    fn on_ping_timeout(&self, seq: u32) {
        let missed = {
            let mut state = self.state.lock().unwrap();
            match state.pending_ping {
                Some((pending_seq, _)) if pending_seq == seq => {
                    state.pending_ping = None;
                    state.consecutive_missed += 1;
                    Some(state.consecutive_missed)
                }
                _ => None,
            }
        };
        if let Some(missed_count) = missed {
            self.metrics.heartbeat_missed(self.channel.label(), missed_count);
            self.events.publish(HeartbeatEvent::Missed { seq, missed_count });
            if missed_count >= self.config.max_missed {
                self.events.publish(HeartbeatEvent::Dead);
            }
        }
    }

    /// Called when `__heartbeat_pong__` is routed to this manager. Pongs with a
    /// non-matching seq are ignored, not errored (§4.8 invariant).
    pub(crate) fn handle_pong(&self, params: Option<Value>) {
        let Some(params) = params else { return };
        let Some(seq) = params.get("seq").and_then(|v| v.as_u64()).map(|v| v as u32) else {
            return;
        };
        let load = params.get("load").cloned();

        let outcome = {
            let mut state = self.state.lock().unwrap();
            match state.pending_ping {
                Some((pending_seq, sent_at)) if pending_seq == seq => {
                    state.pending_ping = None;
                    let was_missed = state.consecutive_missed > 0;
                    state.consecutive_missed = 0;
                    state.last_pong_at = Some(Instant::now());
                    Some((sent_at, was_missed))
                }
                _ => None,
            }
        };

        if let Some((sent_at, was_missed)) = outcome {
            self.events.publish(HeartbeatEvent::Pong {
                seq,
                latency_ms: sent_at.elapsed().as_millis() as u64,
                load,
            });
            if was_missed {
                self.events.publish(HeartbeatEvent::Recovered);
            }
        }
    }

    /// Implicit heartbeat (§9): any successful channel traffic counts as liveness.
    pub(crate) fn handle_activity(&self) {
        if !self.config.implicit_heartbeat {
            return;
        }
        let was_missed = {
            let mut state = self.state.lock().unwrap();
            let was_missed = state.consecutive_missed > 0;
            state.pending_ping = None;
            state.consecutive_missed = 0;
            state.last_pong_at = Some(Instant::now());
            was_missed
        };
        if was_missed {
            self.events.publish(HeartbeatEvent::Recovered);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::NotificationRouter;
    use crate::codec::JsonCodec;
    use crate::error::Result as CoreResult;
    use crate::framing::LineFraming;
    use crate::transport::{Transport, TransportState};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    struct DuplexTransport(DuplexStream);

    #[async_trait]
    impl Transport for DuplexTransport {
        async fn connect(&mut self) -> CoreResult<()> {
            Ok(())
        }

        async fn write_all(&mut self, buf: &[u8]) -> CoreResult<()> {
            self.0
                .write_all(buf)
                .await
                .map_err(|e| crate::error::CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
        }

        async fn read(&mut self, buf: &mut [u8]) -> CoreResult<usize> {
            self.0
                .read(buf)
                .await
                .map_err(|e| crate::error::CoreError::Transport { endpoint: "duplex".into(), cause: e.to_string() })
        }

        async fn disconnect(&mut self) -> CoreResult<()> {
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

    async fn recv_within(rx: &mut broadcast::Receiver<HeartbeatEvent>, timeout: Duration) -> Option<HeartbeatEvent> {
        tokio::time::timeout(timeout, rx.recv()).await.ok()?.ok()
    }

    #[tokio::test]
    async fn cooperative_peer_exchanges_pong_and_clears_state() {
        let (left, right) = make_pair();

        // Simulate a well-behaved worker: echo every ping back as a pong.
        let right_for_reply = right.clone();
        let responder = Arc::new(NotificationRouter::new());
        responder.on(reserved::HEARTBEAT_PING, {
            let right = right_for_reply.clone();
            Arc::new(move |params: Option<Value>| {
                let right = right.clone();
                let seq = params.as_ref().and_then(|p| p.get("seq")).cloned().unwrap_or(json!(0));
                tokio::spawn(async move {
                    let _ = right.notify(reserved::HEARTBEAT_PONG, Some(json!({ "seq": seq }))).await;
                });
            })
        });
        right.on_notification(responder as Arc<dyn crate::channel::NotificationHandler>).await;

        let heartbeat = HeartbeatManager::new(
            left.clone(),
            HeartbeatConfig {
                interval: Duration::from_millis(30),
                timeout: Duration::from_millis(200),
                max_missed: 3,
                implicit_heartbeat: true,
            },
        );
        let pong_router = Arc::new(NotificationRouter::new());
        pong_router.on(reserved::HEARTBEAT_PONG, {
            let heartbeat = heartbeat.clone();
            Arc::new(move |params: Option<Value>| heartbeat.handle_pong(params))
        });
        left.on_notification(pong_router as Arc<dyn crate::channel::NotificationHandler>).await;

        left.start().await.unwrap();
        right.start().await.unwrap();

        let mut events = heartbeat.events();
        heartbeat.start();

        let event = recv_within(&mut events, Duration::from_secs(1)).await;
        match event {
            Some(HeartbeatEvent::Pong { seq, .. }) => assert_eq!(seq, 1),
            other => panic!("expected a Pong event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanswered_pings_mark_the_peer_dead() {
        let (left, _right) = make_pair();
        // `_right` never installs a notification handler, so pings go unanswered.

        let heartbeat = HeartbeatManager::new(
            left.clone(),
            HeartbeatConfig {
                interval: Duration::from_millis(20),
                timeout: Duration::from_millis(20),
                max_missed: 2,
                implicit_heartbeat: true,
            },
        );
        left.start().await.unwrap();

        let mut events = heartbeat.events();
        heartbeat.start();

        let mut saw_dead = false;
        for _ in 0..10 {
            match recv_within(&mut events, Duration::from_millis(500)).await {
                Some(HeartbeatEvent::Dead) => {
                    saw_dead = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_dead, "expected a Dead event once max_missed was exceeded");
    }

    #[tokio::test]
    async fn implicit_activity_clears_a_prior_missed_count() {
        let (left, _right) = make_pair();
        let heartbeat = HeartbeatManager::new(left, HeartbeatConfig::default());

        {
            let mut state = heartbeat.state.lock().unwrap();
            state.consecutive_missed = 2;
        }

        let mut events = heartbeat.events();
        heartbeat.handle_activity();

        match recv_within(&mut events, Duration::from_millis(200)).await {
            Some(HeartbeatEvent::Recovered) => {}
            other => panic!("expected Recovered, got {other:?}"),
        }
        assert_eq!(heartbeat.state.lock().unwrap().consecutive_missed, 0);
    }
}
