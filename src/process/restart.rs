//! Restart policy and exponential-backoff bookkeeping (§4.7, §8 "ExponentialBackoff").
//!
//! Grounded on `examples/other_examples/4a4d9f68_newrelic-newrelic-agent-control__...-supervisor-runner.rs.rs`'s
//! `RestartPolicy`/`BackoffStrategy` split, reimplemented against a `VecDeque` of
//! timestamps instead of OS-thread bookkeeping.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Restart policy for one worker, supplied at spawn time and reused verbatim on
/// every respawn.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub enabled: bool,
    pub max_restarts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub window_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_restarts: 3,
            backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            window_ms: 60_000,
        }
    }
}

/// `delay(attempt) = min(base * 2^(attempt-1), max)`, for `attempt >= 1`.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    debug_assert!(attempt >= 1);
    let shift = attempt.saturating_sub(1).min(32);
    let scaled = base_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(scaled.min(max_ms))
}

/// Per-worker sliding-window restart history.
///
/// The attempt counter is not reset by quiet periods shorter than `windowMs` —
/// only timestamps older than the window are trimmed — so a worker that crashes
/// twice, goes quiet for a while, then crashes again within the window still
/// backs off as attempt 3, not attempt 1 (§9 open question, preserved verbatim).
#[derive(Debug, Default)]
pub struct RestartBookkeeping {
    timestamps: VecDeque<Instant>,
}

impl RestartBookkeeping {
    pub fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) > window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns `Some(attempt)` (1-based, within budget) and records `now`, or
    /// `None` if the restart budget for this window is exhausted.
    pub fn try_record(&mut self, now: Instant, policy: &RestartPolicy) -> Option<u32> {
        let window = Duration::from_millis(policy.window_ms);
        self.trim(now, window);
        if self.timestamps.len() >= policy.max_restarts as usize {
            return None;
        }
        self.timestamps.push_back(now);
        Some(self.timestamps.len() as u32)
    }
}
