//! Handler collaborator API and cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sweb_common::error::SwebResult;

use crate::protocol::DecodedRequest;

/// Shared cancellation flag handed to every running handler task.
///
/// Cancellation is advisory: the core requests a stop and removes the task from its registry,
/// but only the handler can actually observe the flag and return. Both replacement-driven and
/// timeout-driven cancellation use this one mechanism.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a cooperative stop. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` once a stop has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Write side of one client connection, as seen by a handler.
pub trait ResponseSink: Send + Sync {
    /// Writes response bytes to the client, observing `cancel` while waiting for socket
    /// writability.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::Io` on socket failure and `SwebError::InvalidState` when the write
    /// is abandoned because the task was cancelled.
    fn write_response(&self, bytes: &[u8], cancel: &CancelToken) -> SwebResult<()>;
}

/// Business-logic collaborator invoked once per fully decoded request.
///
/// Runs on a worker-pool thread and may block, but must observe `cancel` at its yield points
/// and return promptly once cancellation is requested.
pub trait RequestHandler: Send + Sync {
    /// Handles one request, writing any response through `sink`.
    ///
    /// # Errors
    ///
    /// Errors are logged by the worker pool; they never affect other connections.
    fn handle(
        &self,
        request: &DecodedRequest,
        sink: &dyn ResponseSink,
        cancel: &CancelToken,
    ) -> SwebResult<()>;
}
