//! ReconnectManager (C9): backoff-driven reconnection with bounded request
//! queueing (§4.9).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot, Mutex};

use crate::error::{CoreError, Result};
use crate::events::EventBus;

use super::backoff_delay;

/// Anything a [`ReconnectManager`] can attempt to bring back up.
#[async_trait]
pub trait Reconnectable: Send + Sync {
    async fn connect(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub queue_capacity: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReconnectEvent {
    Attempting { attempt: u32, delay_ms: u64 },
    Success { attempt: u32, total_time_ms: u64 },
    Failed { attempts: u32, last_error: String },
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type QueuedCall = Box<dyn FnOnce() -> BoxFuture<Result<Value>> + Send>;

struct QueueState {
    is_reconnecting: bool,
    last_error: Option<String>,
    queue: VecDeque<(QueuedCall, oneshot::Sender<Result<Value>>)>,
}

/// Drives reconnection attempts against a [`Reconnectable`] target, queueing
/// calls made while reconnecting (up to `queue_capacity`) instead of failing
/// them outright.
pub struct ReconnectManager<R: Reconnectable + 'static> {
    target: Arc<R>,
    config: ReconnectConfig,
    state: Mutex<QueueState>,
    events: EventBus<ReconnectEvent>,
}

impl<R: Reconnectable + 'static> ReconnectManager<R> {
    pub fn new(target: Arc<R>, config: ReconnectConfig) -> Arc<Self> {
        Arc::new(Self {
            target,
            config,
            state: Mutex::new(QueueState {
                is_reconnecting: false,
                last_error: None,
                queue: VecDeque::new(),
            }),
            events: EventBus::new(),
        })
    }

    pub fn events(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.events.subscribe()
    }

    pub async fn is_reconnecting(&self) -> bool {
        self.state.lock().await.is_reconnecting
    }

    /// If a reconnect is in flight and the queue has room, enqueues `call` and
    /// returns a receiver for its eventual result. Returns `None` when the
    /// caller should just perform `call` directly (no reconnect underway, or
    /// the queue is full and `call` should fail fast).
    pub async fn queue_request(&self, call: QueuedCall) -> Option<oneshot::Receiver<Result<Value>>> {
        let mut state = self.state.lock().await;
        if !state.is_reconnecting {
            return None;
        }
        if state.queue.len() >= self.config.queue_capacity {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(CoreError::Closed));
            return Some(rx);
        }
        let (tx, rx) = oneshot::channel();
        state.queue.push_back((call, tx));
        Some(rx)
    }

    /// Runs the reconnect loop to completion: retries with exponential
    /// backoff until `connect()` succeeds or `max_attempts` is exhausted, then
    /// drains the queue (successes re-run the call; on final failure every
    /// queued caller is rejected with the last error).
    pub async fn run(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.is_reconnecting {
                return;
            }
            state.is_reconnecting = true;
        }

        let start = Instant::now();
        let mut attempt = 0u32;
        let outcome = loop {
            attempt += 1;
            let delay = backoff_delay(attempt, self.config.base_delay.as_millis() as u64, self.config.max_delay.as_millis() as u64);
            self.events.publish(ReconnectEvent::Attempting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::time::sleep(delay).await;

            match self.target.connect().await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    self.state.lock().await.last_error = Some(e.to_string());
                    if attempt >= self.config.max_attempts {
                        break Err(e.to_string());
                    }
                }
            }
        };

        match outcome {
            Ok(()) => {
                self.events.publish(ReconnectEvent::Success {
                    attempt,
                    total_time_ms: start.elapsed().as_millis() as u64,
                });
                self.drain_queue(true).await;
            }
            Err(last_error) => {
                self.events.publish(ReconnectEvent::Failed {
                    attempts: attempt,
                    last_error,
                });
                self.drain_queue(false).await;
            }
        }

        let mut state = self.state.lock().await;
        state.is_reconnecting = false;
        state.last_error = None;
    }

    async fn drain_queue(&self, succeeded: bool) {
        let drained: Vec<_> = {
            let mut state = self.state.lock().await;
            let last_error = state.last_error.clone().unwrap_or_else(|| "reconnect failed".into());
            state.queue.drain(..).map(move |item| (item, last_error.clone())).collect()
        };
        for ((call, tx), last_error) in drained {
            if succeeded {
                let result = call().await;
                let _ = tx.send(result);
            } else {
                let _ = tx.send(Err(CoreError::Protocol(last_error)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyTarget {
        succeed_after: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Reconnectable for FlakyTarget {
        async fn connect(&self) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt >= self.succeed_after {
                Ok(())
            } else {
                Err(CoreError::Transport { endpoint: "flaky".into(), cause: "refused".into() })
            }
        }
    }

    fn fast_config(max_attempts: u32, queue_capacity: usize) -> ReconnectConfig {
        ReconnectConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts,
            queue_capacity,
        }
    }

    #[tokio::test]
    async fn succeeds_after_retrying_and_drains_queued_calls() {
        let target = Arc::new(FlakyTarget { succeed_after: 3, attempts: AtomicU32::new(0) });
        let manager = ReconnectManager::new(target, fast_config(10, 8));
        let mut events = manager.events();

        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        // Give `run` a moment to flip `is_reconnecting` before we enqueue.
        while !manager.is_reconnecting().await {
            tokio::task::yield_now().await;
        }

        let queued: QueuedCall = Box::new(|| Box::pin(async { Ok(json!({"ok": true})) }));
        let rx = manager.queue_request(queued).await.expect("should queue while reconnecting");

        run.await.unwrap();

        assert_eq!(rx.await.unwrap().unwrap(), json!({"ok": true}));
        assert!(!manager.is_reconnecting().await);

        let mut saw_success = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ReconnectEvent::Success { attempt, .. } if attempt == 3) {
                saw_success = true;
            }
        }
        assert!(saw_success);
    }

    #[tokio::test]
    async fn exhausting_attempts_rejects_every_queued_call() {
        let target = Arc::new(FlakyTarget { succeed_after: u32::MAX, attempts: AtomicU32::new(0) });
        let manager = ReconnectManager::new(target, fast_config(3, 8));

        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        while !manager.is_reconnecting().await {
            tokio::task::yield_now().await;
        }

        let queued: QueuedCall = Box::new(|| Box::pin(async { Ok(Value::Null) }));
        let rx = manager.queue_request(queued).await.expect("should queue while reconnecting");

        run.await.unwrap();

        match rx.await.unwrap() {
            Err(CoreError::Protocol(_)) => {}
            other => panic!("expected a rejected queued call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_request_returns_none_when_not_reconnecting() {
        let target = Arc::new(FlakyTarget { succeed_after: 1, attempts: AtomicU32::new(0) });
        let manager = ReconnectManager::new(target, fast_config(3, 8));
        let queued: QueuedCall = Box::new(|| Box::pin(async { Ok(Value::Null) }));
        assert!(manager.queue_request(queued).await.is_none());
    }

    #[tokio::test]
    async fn full_queue_rejects_overflow_immediately() {
        let target = Arc::new(FlakyTarget { succeed_after: u32::MAX, attempts: AtomicU32::new(0) });
        let manager = ReconnectManager::new(target, fast_config(2, 1));

        let run = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        while !manager.is_reconnecting().await {
            tokio::task::yield_now().await;
        }

        let first: QueuedCall = Box::new(|| Box::pin(async { Ok(Value::Null) }));
        let second: QueuedCall = Box::new(|| Box::pin(async { Ok(Value::Null) }));
        let _first_rx = manager.queue_request(first).await.expect("first call queues");
        let second_rx = manager.queue_request(second).await.expect("second call still returns a receiver");

        assert!(matches!(second_rx.await.unwrap(), Err(CoreError::Closed)));

        run.await.unwrap();
    }
}
