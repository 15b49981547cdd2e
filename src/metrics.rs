//! Lightweight instrumentation hooks for the process/channel/resilience layers.
//!
//! The ambient-observability counterpart to `tracing`: where `tracing` emits
//! human-readable log lines, `MetricsSink` gives a caller a stable, structured
//! place to wire counters into whatever metrics backend their application
//! already uses, without pulling one in as a dependency of this crate.

use std::sync::atomic::{AtomicU64, Ordering};

/// Hook methods fire on the event points that matter to an operator watching a
/// fleet of workers: spawns, restarts, crashes, request latency, and heartbeat
/// misses. Every method has a default no-op body, so implementors only
/// override what they care about.
pub trait MetricsSink: Send + Sync {
    fn worker_spawned(&self, _worker_id: &str) {}
    fn worker_restarted(&self, _worker_id: &str, _attempt: u32) {}
    fn worker_crashed(&self, _worker_id: &str) {}
    fn request_completed(&self, _method: &str, _latency_ms: u64, _success: bool) {}
    fn heartbeat_missed(&self, _worker_id: &str, _missed_count: u32) {}
}

/// Discards everything. The default sink when a caller doesn't wire one in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {}

/// A `MetricsSink` backed by plain atomic counters, useful in tests and as a
/// minimal standalone sink for callers who just want rough totals without
/// standing up a real metrics backend.
#[derive(Debug, Default)]
pub struct CountingMetricsSink {
    spawns: AtomicU64,
    restarts: AtomicU64,
    crashes: AtomicU64,
    requests_ok: AtomicU64,
    requests_failed: AtomicU64,
    heartbeat_misses: AtomicU64,
}

impl CountingMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawns(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    pub fn crashes(&self) -> u64 {
        self.crashes.load(Ordering::Relaxed)
    }

    pub fn requests_ok(&self) -> u64 {
        self.requests_ok.load(Ordering::Relaxed)
    }

    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn heartbeat_misses(&self) -> u64 {
        self.heartbeat_misses.load(Ordering::Relaxed)
    }
}

impl MetricsSink for CountingMetricsSink {
    fn worker_spawned(&self, _worker_id: &str) {
        self.spawns.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_restarted(&self, _worker_id: &str, _attempt: u32) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_crashed(&self, _worker_id: &str) {
        self.crashes.fetch_add(1, Ordering::Relaxed);
    }

    fn request_completed(&self, _method: &str, _latency_ms: u64, success: bool) {
        if success {
            self.requests_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn heartbeat_missed(&self, _worker_id: &str, _missed_count: u32) {
        self.heartbeat_misses.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_sink_tracks_each_hook() {
        let sink = CountingMetricsSink::new();
        sink.worker_spawned("w1");
        sink.worker_restarted("w1", 1);
        sink.worker_crashed("w1");
        sink.request_completed("echo", 5, true);
        sink.request_completed("echo", 5, false);
        sink.heartbeat_missed("w1", 1);

        assert_eq!(sink.spawns(), 1);
        assert_eq!(sink.restarts(), 1);
        assert_eq!(sink.crashes(), 1);
        assert_eq!(sink.requests_ok(), 1);
        assert_eq!(sink.requests_failed(), 1);
        assert_eq!(sink.heartbeat_misses(), 1);
    }

    #[test]
    fn noop_sink_accepts_all_hooks() {
        let sink = NoopMetricsSink;
        sink.worker_spawned("w1");
        sink.request_completed("echo", 1, true);
    }
}
