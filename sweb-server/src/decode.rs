//! Decode stage: bridges "socket is readable" events into "a request is fully decoded".
//!
//! The stage runs on a fixed short period instead of per-event, trading a small fixed latency
//! for bounded CPU usage under bursty readiness storms. Actual framing is delegated to the
//! decoder collaborator; this module only drains readiness events, drives per-connection
//! decoder state, and hands completed requests to the dispatch loop over a bounded queue.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use sweb_common::error::SwebResult;
use sweb_common::ids::{ConnectionId, TaskId};
use sweb_http::connection::{DecoderFactory, RequestDecoder};
use sweb_http::protocol::DecodedRequest;

use crate::channel::ClientChannel;
use crate::dispatch::{ConnectionRegistry, HandlerTask};
use crate::network::SelectorHandle;

const READ_CHUNK_BYTES: usize = 8192;

/// One readiness notification forwarded by the selector loop.
#[derive(Debug)]
pub(crate) struct DecodeTask {
    pub(crate) channel: ClientChannel,
    pub(crate) closed_or_error: bool,
}

/// Per-connection decoder states, keyed by stable connection id.
///
/// Only the decode stage advances these states. The dispatch loop clears one when handler
/// ownership of the connection begins; the reaper drops one when its connection is reaped.
pub(crate) struct DecoderTable {
    factory: Arc<DecoderFactory>,
    states: Mutex<HashMap<ConnectionId, Box<dyn RequestDecoder>>>,
}

impl DecoderTable {
    pub(crate) fn new(factory: Arc<DecoderFactory>) -> Self {
        Self {
            factory,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Box<dyn RequestDecoder>>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feeds one chunk into the connection's decoder and pops every completed request.
    ///
    /// # Errors
    ///
    /// Propagates framing errors from the decoder collaborator.
    fn feed_and_pop(
        &self,
        id: ConnectionId,
        bytes: &[u8],
    ) -> SwebResult<Vec<DecodedRequest>> {
        let mut states = self.lock();
        let state = states.entry(id).or_insert_with(|| (self.factory)());
        state.feed_bytes(bytes);

        let mut completed = Vec::new();
        while let Some(request) = state.try_pop_request()? {
            completed.push(request);
        }
        Ok(completed)
    }

    /// Drops one connection's decoder state, if any.
    pub(crate) fn remove(&self, id: ConnectionId) {
        let _ = self.lock().remove(&id);
    }

    /// Number of connections with live decoder state.
    pub(crate) fn state_count(&self) -> usize {
        self.lock().len()
    }
}

impl std::fmt::Debug for DecoderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderTable")
            .field("states", &self.state_count())
            .finish()
    }
}

/// Periodic poller draining readiness events into completed-request tasks.
pub(crate) struct DecodeStage {
    tasks: mpsc::UnboundedReceiver<DecodeTask>,
    decoders: Arc<DecoderTable>,
    registry: Arc<ConnectionRegistry>,
    selector: SelectorHandle,
    dispatch: mpsc::Sender<HandlerTask>,
    pending_dispatch: VecDeque<HandlerTask>,
    next_task_id: TaskId,
}

impl DecodeStage {
    pub(crate) fn new(
        tasks: mpsc::UnboundedReceiver<DecodeTask>,
        decoders: Arc<DecoderTable>,
        registry: Arc<ConnectionRegistry>,
        selector: SelectorHandle,
        dispatch: mpsc::Sender<HandlerTask>,
    ) -> Self {
        Self {
            tasks,
            decoders,
            registry,
            selector,
            dispatch,
            pending_dispatch: VecDeque::new(),
            next_task_id: 1,
        }
    }

    /// One scheduled advancement: drain queued readiness events, then flush completed
    /// requests into the bounded dispatch hand-off. Returns promptly even with no work.
    pub(crate) fn tick(&mut self) {
        self.flush_pending();
        while let Ok(task) = self.tasks.try_recv() {
            self.process_readiness(&task);
        }
        self.flush_pending();
    }

    fn process_readiness(&mut self, task: &DecodeTask) {
        let id = task.channel.id();
        if !self.registry.contains(id) {
            return;
        }

        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        let mut peer_done = task.closed_or_error;
        loop {
            match task.channel.read_chunk(&mut chunk) {
                Ok(0) => {
                    peer_done = true;
                    break;
                }
                Ok(read_len) => {
                    self.registry.touch(id);
                    match self.decoders.feed_and_pop(id, &chunk[..read_len]) {
                        Ok(completed) => {
                            for request in completed {
                                self.enqueue_handler_task(&task.channel, request);
                            }
                        }
                        Err(decode_error) => {
                            warn!(
                                connection = id,
                                "closing connection after decode failure: {decode_error}"
                            );
                            self.retire_connection(id);
                            return;
                        }
                    }
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(connection = id, "read failed: {error}");
                    peer_done = true;
                    break;
                }
            }
        }

        if peer_done {
            self.retire_connection(id);
        }
    }

    fn enqueue_handler_task(&mut self, channel: &ClientChannel, request: DecodedRequest) {
        let task_id = self.next_task_id;
        self.next_task_id = self.next_task_id.saturating_add(1);
        self.pending_dispatch.push_back(HandlerTask {
            task_id,
            channel: channel.clone(),
            request,
        });
    }

    fn retire_connection(&mut self, id: ConnectionId) {
        let _ = self.registry.close_connection(id);
        self.decoders.remove(id);
        self.selector.retire(id);
    }

    fn flush_pending(&mut self) {
        while let Some(task) = self.pending_dispatch.pop_front() {
            match self.dispatch.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) => {
                    self.pending_dispatch.push_front(task);
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    self.pending_dispatch.clear();
                    break;
                }
            }
        }
    }
}
