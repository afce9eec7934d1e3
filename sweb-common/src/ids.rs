//! Canonical identifier types used across the selector, dispatch, and reaping layers.

/// Monotonic logical connection id allocated by the accept path.
///
/// Connection identity is always this stable number, never the raw socket handle, so registry
/// keys stay valid across socket reuse by the OS.
pub type ConnectionId = u64;

/// Monotonic handler-task id allocated when a request finishes decoding.
pub type TaskId = u64;

/// Strongly typed worker-count wrapper to avoid passing raw integers around executor APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerCount(u16);

impl WorkerCount {
    /// Creates a validated worker-count value.
    ///
    /// Returns `None` for zero because the handler executor always requires at least one
    /// worker thread.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }
}
