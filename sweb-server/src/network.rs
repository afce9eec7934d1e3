//! Accept/selector loop owning the readiness multiplexer.
//!
//! This is the only component that blocks waiting for readiness. Accepted sockets are set
//! non-blocking and registered for read interest; readable connections are forwarded to the
//! decode stage as `DecodeTask`s. A failure while handling one event never aborts the
//! remaining events or the loop; only an explicit shutdown through `SelectorHandle`
//! terminates it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use sweb_common::error::{SwebError, SwebResult};
use sweb_common::ids::ConnectionId;

use crate::channel::ClientChannel;
use crate::decode::DecodeTask;
use crate::dispatch::ConnectionRegistry;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const CONNECTION_TOKEN_START: usize = 2;
const MAX_EVENTS: usize = 256;

/// Cheap cloneable control surface over the selector loop.
#[derive(Debug, Clone)]
pub(crate) struct SelectorHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    retired_tx: mpsc::UnboundedSender<ConnectionId>,
}

impl SelectorHandle {
    /// Requests loop termination. Safe to call more than once; only the flag transition and
    /// the wake-up matter.
    pub(crate) fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(wake_error) = self.waker.wake() {
            error!("wake selector for shutdown failed: {wake_error}");
        }
    }

    /// Announces that a connection was closed elsewhere so the selector releases its handle.
    pub(crate) fn retire(&self, id: ConnectionId) {
        if self.retired_tx.send(id).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Builds a handle wired to a throwaway poller, for components tested without a
    /// running selector loop.
    #[cfg(test)]
    pub(crate) fn detached_for_tests() -> Self {
        let poll = Poll::new().expect("test poll should build");
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("test waker should build");
        let (retired_tx, _retired_rx) = mpsc::unbounded_channel();
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
            retired_tx,
        }
    }
}

/// The single multiplexing loop: accepts connections and forwards readiness.
pub(crate) struct ServerSelector {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    retired_rx: mpsc::UnboundedReceiver<ConnectionId>,
    connections: HashMap<Token, ClientChannel>,
    token_by_connection: HashMap<ConnectionId, Token>,
    next_token: usize,
    next_connection_id: ConnectionId,
    decode_tx: mpsc::UnboundedSender<DecodeTask>,
    registry: Arc<ConnectionRegistry>,
}

impl ServerSelector {
    /// Binds the listener and initializes the multiplexer.
    ///
    /// # Errors
    ///
    /// Returns `SwebError` when the address does not parse or when bind/registration fails.
    /// On failure nothing is retained; the caller stays uncreated.
    pub(crate) fn bind(
        host: &str,
        port: u16,
        decode_tx: mpsc::UnboundedSender<DecodeTask>,
        registry: Arc<ConnectionRegistry>,
    ) -> SwebResult<(Self, SelectorHandle)> {
        let addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .map_err(|_| SwebError::InvalidConfig("bind host/port is not a socket address"))?;

        let poll =
            Poll::new().map_err(|error| SwebError::Io(format!("create poll failed: {error}")))?;
        let mut listener = TcpListener::bind(addr)
            .map_err(|error| SwebError::Io(format!("bind listener on {addr} failed: {error}")))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| {
                SwebError::Io(format!("register listener in poll failed: {error}"))
            })?;
        let waker = Arc::new(
            Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|error| SwebError::Io(format!("create poll waker failed: {error}")))?,
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let (retired_tx, retired_rx) = mpsc::unbounded_channel();
        let handle = SelectorHandle {
            shutdown: Arc::clone(&shutdown),
            waker,
            retired_tx,
        };
        let selector = Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            listener,
            shutdown,
            retired_rx,
            connections: HashMap::new(),
            token_by_connection: HashMap::new(),
            next_token: CONNECTION_TOKEN_START,
            next_connection_id: 1,
            decode_tx,
            registry,
        };
        Ok((selector, handle))
    }

    pub(crate) fn local_addr(&self) -> SwebResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|error| SwebError::Io(format!("query local address failed: {error}")))
    }

    /// Runs until shutdown is requested through the handle.
    pub(crate) fn run(&mut self) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Err(poll_error) = self.poll.poll(&mut self.events, None) {
                if poll_error.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!("selector poll failed: {poll_error}");
                continue;
            }

            let snapshots = self
                .events
                .iter()
                .map(|event| {
                    (
                        event.token(),
                        event.is_read_closed() || event.is_write_closed() || event.is_error(),
                    )
                })
                .collect::<Vec<_>>();
            for (token, closed_or_error) in snapshots {
                match token {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.accept_new_connections(),
                    connection_token => self.forward_readiness(connection_token, closed_or_error),
                }
            }
            self.drain_retired();
        }
        self.drain_retired();
        info!("selector loop stopped");
    }

    fn accept_new_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut socket, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token = self.next_token.saturating_add(1);
                    if let Err(register_error) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        // Dropping the socket closes the half-accepted connection.
                        error!("register accepted connection failed: {register_error}");
                        continue;
                    }
                    let _ = socket.set_nodelay(true);

                    let id = self.next_connection_id;
                    self.next_connection_id = self.next_connection_id.saturating_add(1);
                    let channel = ClientChannel::new(id, socket);
                    self.registry.insert_connection(channel.clone());
                    let _ = self.connections.insert(token, channel);
                    let _ = self.token_by_connection.insert(id, token);
                    debug!(connection = id, peer = %peer, "accepted connection");
                }
                Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(accept_error) => {
                    error!("accept connection failed: {accept_error}");
                    return;
                }
            }
        }
    }

    fn forward_readiness(&mut self, token: Token, closed_or_error: bool) {
        let Some(channel) = self.connections.get(&token) else {
            return;
        };
        let task = DecodeTask {
            channel: channel.clone(),
            closed_or_error,
        };
        if self.decode_tx.send(task).is_err() {
            debug!("decode stage is gone; dropping readiness event");
        }
    }

    fn drain_retired(&mut self) {
        while let Ok(id) = self.retired_rx.try_recv() {
            if let Some(token) = self.token_by_connection.remove(&id) {
                let _ = self.connections.remove(&token);
            }
        }
    }

    #[cfg(test)]
    fn tracked_connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for ServerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSelector")
            .field("connections", &self.connections.len())
            .field("next_token", &self.next_token)
            .field("next_connection_id", &self.next_connection_id)
            .finish()
    }
}
