//! Identifiers shared across the crate: worker ids and request ids.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Caller-supplied identifier for a supervised worker.
///
/// Unique within a single [`crate::process::ProcessManager`] for the lifetime of a
/// registration; re-registering a terminated id is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    /// Builds a worker id, rejecting the empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, crate::error::CoreError> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::error::CoreError::InvalidWorkerId(
                "worker id must not be empty".into(),
            ));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

/// Request id correlating a request envelope with its response.
///
/// Zero is reserved to mean "not a response" and is never emitted by
/// [`RequestIdGenerator`].
pub type RequestId = u64;

/// Monotonic, never-repeating, never-zero request id source for one channel's lifetime.
#[derive(Debug, Default)]
pub struct RequestIdGenerator(AtomicU64);

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Returns the next id. The first call returns 1.
    pub fn next(&self) -> RequestId {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
