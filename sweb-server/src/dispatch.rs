//! Dispatch loop and the authoritative connection registry.
//!
//! The registry maps every live connection to at most one active handler task. The dispatch
//! loop is the only writer of the active-handler slot; the reaper and the peer-close path are
//! the only writers of connection removal. Every transition happens under one lock
//! acquisition, so task replacement and connection reaping can never interleave destructively:
//! after a connection is removed, any later-arriving task for it is rejected instead of
//! resurrecting the entry.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use sweb_common::ids::{ConnectionId, TaskId};
use sweb_http::handler::CancelToken;
use sweb_http::protocol::DecodedRequest;

use crate::channel::ClientChannel;
use crate::decode::DecoderTable;
use crate::worker::WorkerPool;

/// Replacement-policy classification of one handler task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// One-shot request/response task; superseded by later tasks on the same connection.
    Ordinary,
    /// Tunnel establishment; owns the connection for its whole remaining lifetime.
    Tunnel,
}

/// One fully decoded request awaiting or undergoing execution.
#[derive(Debug)]
pub struct HandlerTask {
    pub task_id: TaskId,
    pub channel: ClientChannel,
    pub request: DecodedRequest,
}

impl HandlerTask {
    /// Connection this task belongs to.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.channel.id()
    }

    /// Classification driving the registry replacement policy.
    #[must_use]
    pub fn kind(&self) -> TaskKind {
        if self.request.method.is_tunnel() {
            TaskKind::Tunnel
        } else {
            TaskKind::Ordinary
        }
    }
}

/// Outcome of offering one task to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The task is now the connection's active handler and must be submitted.
    Submitted,
    /// The connection is owned by a tunnel, or the task is a duplicate tunnel; drop it.
    Dropped,
    /// The connection was already closed or reaped; the task must not run.
    RejectedClosed,
}

#[derive(Debug)]
struct ActiveHandler {
    task_id: TaskId,
    kind: TaskKind,
    cancel: CancelToken,
}

#[derive(Debug)]
struct RegistryEntry {
    channel: ClientChannel,
    last_activity: Instant,
    active: Option<ActiveHandler>,
}

/// Authoritative mapping from live connections to their active handler tasks.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ConnectionId, RegistryEntry>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, RegistryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts tracking a freshly accepted connection.
    pub(crate) fn insert_connection(&self, channel: ClientChannel) {
        let mut entries = self.lock();
        let _ = entries.insert(
            channel.id(),
            RegistryEntry {
                channel,
                last_activity: Instant::now(),
                active: None,
            },
        );
    }

    /// Records decode-observed activity for idle accounting.
    pub(crate) fn touch(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Returns `true` while the connection is still tracked.
    pub(crate) fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Applies the replacement policy for one incoming task.
    ///
    /// An ordinary task interrupts any ordinary predecessor before it becomes visible as the
    /// active handler, so the connection never has two simultaneously registered ordinary
    /// tasks. A connection owned by a tunnel never changes hands again.
    pub(crate) fn begin_task(&self, task: &HandlerTask, cancel: CancelToken) -> BeginOutcome {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&task.connection_id()) else {
            return BeginOutcome::RejectedClosed;
        };

        match (&entry.active, task.kind()) {
            (Some(active), _) if active.kind == TaskKind::Tunnel => BeginOutcome::Dropped,
            (Some(_), TaskKind::Tunnel) => BeginOutcome::Dropped,
            (_, kind) => {
                if let Some(superseded) = entry.active.take() {
                    superseded.cancel.cancel();
                }
                entry.active = Some(ActiveHandler {
                    task_id: task.task_id,
                    kind,
                    cancel,
                });
                BeginOutcome::Submitted
            }
        }
    }

    /// Clears the active slot when the finishing task is still the installed one.
    ///
    /// A superseded task finishing late must not clear its replacement.
    pub(crate) fn finish_task(&self, id: ConnectionId, task_id: TaskId) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id)
            && entry
                .active
                .as_ref()
                .is_some_and(|active| active.task_id == task_id)
        {
            entry.active = None;
        }
    }

    /// Removes one connection: cancels its active handler and closes the socket.
    ///
    /// Returns `false` when the connection was already gone.
    pub(crate) fn close_connection(&self, id: ConnectionId) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.remove(&id) else {
            return false;
        };
        if let Some(active) = entry.active {
            active.cancel.cancel();
        }
        entry.channel.shutdown();
        true
    }

    /// Removes and closes every connection idle longer than `idle_timeout` at `now`.
    pub(crate) fn collect_expired(
        &self,
        idle_timeout: Duration,
        now: Instant,
    ) -> Vec<ConnectionId> {
        let mut entries = self.lock();
        let expired = entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > idle_timeout)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in &expired {
            if let Some(entry) = entries.remove(id) {
                if let Some(active) = entry.active {
                    active.cancel.cancel();
                }
                entry.channel.shutdown();
            }
        }
        expired
    }

    /// Removes and closes every tracked connection. Used during teardown.
    pub(crate) fn close_all(&self) {
        let mut entries = self.lock();
        for (_, entry) in entries.drain() {
            if let Some(active) = entry.active {
                active.cancel.cancel();
            }
            entry.channel.shutdown();
        }
    }

    /// Number of tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    /// Number of connections with a registered active handler.
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|entry| entry.active.is_some())
            .count()
    }

    /// Returns `true` when `id` has a registered active handler.
    #[must_use]
    pub fn has_active_task(&self, id: ConnectionId) -> bool {
        self.lock()
            .get(&id)
            .is_some_and(|entry| entry.active.is_some())
    }
}

/// Consumes completed-request tasks until the hand-off channel closes.
///
/// Parks on `blocking_recv` while no task is available. Submission failures are surfaced as
/// handling errors for the affected task and rolled back in the registry; they never pass as
/// silent success.
pub(crate) fn run_dispatch_loop(
    mut tasks: mpsc::Receiver<HandlerTask>,
    registry: &ConnectionRegistry,
    decoders: &DecoderTable,
    pool: &WorkerPool,
) {
    while let Some(task) = tasks.blocking_recv() {
        let connection = task.connection_id();
        let task_id = task.task_id;
        let ordinary = task.kind() == TaskKind::Ordinary;
        let cancel = CancelToken::new();

        match registry.begin_task(&task, cancel.clone()) {
            BeginOutcome::Submitted => {
                if ordinary {
                    // Ownership of the connection passes to the handler until it completes;
                    // the next readable event starts from a fresh decoder.
                    decoders.remove(connection);
                }
                if let Err(submit_error) = pool.submit(task, cancel) {
                    registry.finish_task(connection, task_id);
                    error!(connection, "handler submission rejected: {submit_error}");
                }
            }
            BeginOutcome::Dropped => {
                debug!(connection, "dropped task for already-owned connection");
            }
            BeginOutcome::RejectedClosed => {
                info!(connection, "rejected task for closed connection");
            }
        }
    }
}


#[cfg(test)]
impl ConnectionRegistry {
    /// Backdates one entry's activity timestamp for reaper tests.
    pub(crate) fn backdate_activity(&self, id: ConnectionId, at: Instant) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.last_activity = at;
        }
    }
}
