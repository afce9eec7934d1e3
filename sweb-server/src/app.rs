//! Server composition root: the create/listen/destroy lifecycle.
//!
//! Construction resolves effective configuration (explicit values override
//! environment-sourced values, remaining gaps get defaults). `create` binds the listener and
//! multiplexer; `listen` starts the decode stage and reaper on their periodic schedules and
//! the dispatch loop on its own thread before entering the selector loop on the calling
//! thread. `destroy` is idempotent and is the only way to stop the selector.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tokio::sync::mpsc;
use tracing::{info, warn};

use sweb_common::config::{RequestConfig, ResponseConfig, ServerConfig};
use sweb_common::error::{SwebError, SwebResult};
use sweb_common::pid::{default_pid_path, remove_pid, save_pid};
use sweb_http::connection::{DecoderFactory, HttpDecodeState, RequestDecoder};
use sweb_http::handler::{CancelToken, RequestHandler, ResponseSink};
use sweb_http::protocol::DecodedRequest;
use sweb_http::response::encode_response;

use crate::decode::{DecodeStage, DecodeTask, DecoderTable};
use crate::dispatch::{ConnectionRegistry, HandlerTask, run_dispatch_loop};
use crate::network::{SelectorHandle, ServerSelector};
use crate::reaper::TimeoutReaper;
use crate::schedule::spawn_periodic;
use crate::worker::WorkerPool;

struct CreatedServer {
    selector: ServerSelector,
    decode_rx: mpsc::UnboundedReceiver<DecodeTask>,
    dispatch_tx: mpsc::Sender<HandlerTask>,
    dispatch_rx: mpsc::Receiver<HandlerTask>,
    registry: Arc<ConnectionRegistry>,
    decoders: Arc<DecoderTable>,
    handle: SelectorHandle,
}

/// Clone-able destroy control, suitable for registration with process signal handlers.
///
/// The first `destroy` closes the multiplexer; every later call is a no-op.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    destroyed: Arc<AtomicBool>,
    selector: SelectorHandle,
}

impl ShutdownHandle {
    /// Stops the server exactly once, regardless of how often it is invoked.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("closing server");
        self.selector.shutdown();
    }
}

/// Embeddable non-blocking HTTP server.
pub struct HttpServer {
    server_config: ServerConfig,
    request_config: RequestConfig,
    response_config: ResponseConfig,
    handler: Arc<dyn RequestHandler>,
    decoder_factory: Arc<DecoderFactory>,
    pid_path: PathBuf,
    created: Option<CreatedServer>,
    shutdown: Option<ShutdownHandle>,
}

impl HttpServer {
    /// Builds a server around `handler`, resolving effective configuration.
    ///
    /// Absent request/response configs are derived from the server config: cookies per the
    /// resolved flag, UTF-8 charset, gzip off.
    #[must_use]
    pub fn new(
        server_config: ServerConfig,
        request_config: Option<RequestConfig>,
        response_config: Option<ResponseConfig>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let server_config = server_config.resolved();
        let request_config =
            request_config.unwrap_or_else(|| server_config.derived_request_config());
        let response_config =
            response_config.unwrap_or_else(|| server_config.derived_response_config());
        Self {
            server_config,
            request_config,
            response_config,
            handler,
            decoder_factory: Arc::new(|| Box::new(HttpDecodeState::new()) as Box<dyn RequestDecoder>),
            pid_path: default_pid_path(),
            created: None,
            shutdown: None,
        }
    }

    /// Replaces the decoder collaborator used for every new connection.
    #[must_use]
    pub fn with_decoder_factory(mut self, factory: Arc<DecoderFactory>) -> Self {
        self.decoder_factory = factory;
        self
    }

    /// Overrides the PID file location.
    #[must_use]
    pub fn with_pid_path(mut self, path: PathBuf) -> Self {
        self.pid_path = path;
        self
    }

    /// Resolved server configuration.
    #[must_use]
    pub fn server_config(&self) -> &ServerConfig {
        &self.server_config
    }

    /// Resolved request defaults.
    #[must_use]
    pub fn request_config(&self) -> &RequestConfig {
        &self.request_config
    }

    /// Resolved response defaults.
    #[must_use]
    pub fn response_config(&self) -> &ResponseConfig {
        &self.response_config
    }

    /// Binds on the configured port. Returns `false` on failure; failure is logged and leaves
    /// the server uncreated, with no partial state retained.
    pub fn create(&mut self) -> bool {
        self.create_on(self.server_config.port)
    }

    /// Binds on an explicit port (`0` = OS-assigned ephemeral port).
    pub fn create_on(&mut self, port: u16) -> bool {
        match self.build_listener(port) {
            Ok(()) => true,
            Err(create_error) => {
                tracing::error!("create server failed: {create_error}");
                false
            }
        }
    }

    fn build_listener(&mut self, port: u16) -> SwebResult<()> {
        let registry = Arc::new(ConnectionRegistry::new());
        let decoders = Arc::new(DecoderTable::new(Arc::clone(&self.decoder_factory)));
        let (decode_tx, decode_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.server_config.dispatch_queue_limit);
        let (selector, handle) = ServerSelector::bind(
            &self.server_config.host,
            port,
            decode_tx,
            Arc::clone(&registry),
        )?;
        let local_addr = selector.local_addr()?;
        info!(addr = %local_addr, "listening");

        self.shutdown = Some(ShutdownHandle {
            destroyed: Arc::new(AtomicBool::new(false)),
            selector: handle.clone(),
        });
        self.created = Some(CreatedServer {
            selector,
            decode_rx,
            dispatch_tx,
            dispatch_rx,
            registry,
            decoders,
            handle,
        });
        Ok(())
    }

    /// The bound address, available after a successful `create`.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::InvalidState` before `create` succeeded.
    pub fn local_addr(&self) -> SwebResult<std::net::SocketAddr> {
        match &self.created {
            Some(created) => created.selector.local_addr(),
            None => Err(SwebError::InvalidState("server was not created")),
        }
    }

    /// Destroy control for signal handlers and embedders; available after `create`.
    #[must_use]
    pub fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.shutdown.clone()
    }

    /// Stops the server. Idempotent; a no-op before `create`.
    pub fn destroy(&self) {
        if let Some(handle) = &self.shutdown {
            handle.destroy();
        }
    }

    /// Runs the server on the calling thread until `destroy` is invoked.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::InvalidState` without a successful `create`, and `SwebError::Io`
    /// when a required thread cannot be started.
    pub fn listen(&mut self) -> SwebResult<()> {
        let Some(created) = self.created.take() else {
            return Err(SwebError::InvalidState("listen requires a successful create"));
        };
        let CreatedServer {
            mut selector,
            decode_rx,
            dispatch_tx,
            dispatch_rx,
            registry,
            decoders,
            handle,
        } = created;

        info!(
            version = env!("CARGO_PKG_VERSION"),
            "sweb starting"
        );
        if !self.server_config.interceptors.is_empty() {
            info!(interceptors = ?self.server_config.interceptors, "configured interceptors");
        }
        if !self.server_config.router.is_empty() {
            info!("router: {}", self.server_config.router);
        }
        if let Err(pid_error) = save_pid(&self.pid_path) {
            warn!("save pid failed: {pid_error}");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let launch = {
            let stop = Arc::clone(&stop);
            let registry = Arc::clone(&registry);
            let decoders = Arc::clone(&decoders);
            let handler = Arc::clone(&self.handler);
            let server_config = &self.server_config;
            move || -> SwebResult<(
                thread::JoinHandle<()>,
                thread::JoinHandle<()>,
                thread::JoinHandle<()>,
            )> {
                let pool = WorkerPool::new(
                    server_config.worker_count,
                    server_config.worker_queue_limit,
                    handler,
                    Arc::clone(&registry),
                )?;

                let mut stage = DecodeStage::new(
                    decode_rx,
                    Arc::clone(&decoders),
                    Arc::clone(&registry),
                    handle.clone(),
                    dispatch_tx,
                );
                let decode_thread = spawn_periodic(
                    "sweb-decode",
                    server_config.decode_period,
                    Arc::clone(&stop),
                    move || stage.tick(),
                )?;

                let reaper = TimeoutReaper::new(
                    Arc::clone(&registry),
                    Arc::clone(&decoders),
                    handle.clone(),
                    server_config.idle_timeout(),
                );
                let reaper_thread = spawn_periodic(
                    "sweb-reaper",
                    server_config.reaper_period,
                    Arc::clone(&stop),
                    move || reaper.tick(),
                )?;

                let dispatch_thread = thread::Builder::new()
                    .name("sweb-dispatch".to_string())
                    .spawn(move || {
                        run_dispatch_loop(dispatch_rx, &registry, &decoders, &pool);
                        pool.shutdown();
                    })
                    .map_err(|spawn_error| {
                        SwebError::Io(format!("spawn dispatch thread failed: {spawn_error}"))
                    })?;
                Ok((decode_thread, reaper_thread, dispatch_thread))
            }
        };
        let (decode_thread, reaper_thread, dispatch_thread) = match launch() {
            Ok(threads) => threads,
            Err(launch_error) => {
                // Partial schedules observe the flag and exit; their queues close with them.
                stop.store(true, Ordering::Release);
                return Err(launch_error);
            }
        };

        selector.run();

        registry.close_all();
        stop.store(true, Ordering::Release);
        // Joining the decode schedule drops the decode stage, which closes the dispatch
        // hand-off and lets the dispatch thread finish and shut the worker pool down.
        let _ = decode_thread.join();
        let _ = reaper_thread.join();
        let _ = dispatch_thread.join();
        if let Err(pid_error) = remove_pid(&self.pid_path) {
            warn!("remove pid failed: {pid_error}");
        }
        info!("server stopped");
        Ok(())
    }
}

/// Built-in handler used by the binary: answers every request with a status line.
struct StatusHandler {
    response_config: ResponseConfig,
}

impl RequestHandler for StatusHandler {
    fn handle(
        &self,
        request: &DecodedRequest,
        sink: &dyn ResponseSink,
        cancel: &CancelToken,
    ) -> SwebResult<()> {
        let body = format!(
            "sweb {} serving {} {}\n",
            env!("CARGO_PKG_VERSION"),
            request.method.as_str(),
            request.target
        );
        sink.write_response(
            &encode_response(200, "OK", "text/plain", body.as_bytes(), &self.response_config),
            cancel,
        )
    }
}

/// Process bootstrap used by the binary entrypoint.
///
/// # Errors
///
/// Returns an error when the listener cannot be created or a lifecycle thread fails to start.
pub fn run() -> SwebResult<()> {
    let server_config = ServerConfig::default().resolved();
    let response_config = server_config.derived_response_config();
    let handler = Arc::new(StatusHandler {
        response_config: response_config.clone(),
    });
    let mut server = HttpServer::new(server_config, None, Some(response_config), handler);

    if !server.create() {
        return Err(SwebError::InvalidState("server create failed"));
    }
    let handle = server
        .shutdown_handle()
        .ok_or(SwebError::InvalidState("server has no shutdown handle"))?;
    register_shutdown_signals(handle)?;
    server.listen()
}

#[cfg(unix)]
fn register_shutdown_signals(handle: ShutdownHandle) -> SwebResult<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|error| SwebError::Io(format!("install signal handler failed: {error}")))?;
    thread::Builder::new()
        .name("sweb-signal".to_string())
        .spawn(move || {
            if signals.forever().next().is_some() {
                handle.destroy();
            }
        })
        .map_err(|error| SwebError::Io(format!("spawn signal thread failed: {error}")))?;
    Ok(())
}

#[cfg(not(unix))]
fn register_shutdown_signals(_handle: ShutdownHandle) -> SwebResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::HttpServer;
    use crate::dispatch::ConnectionRegistry;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use sweb_common::config::{ResponseConfig, ServerConfig};
    use sweb_common::error::SwebResult;
    use sweb_http::handler::{CancelToken, RequestHandler, ResponseSink};
    use sweb_http::protocol::DecodedRequest;
    use sweb_http::response::encode_response;

    struct GreetingHandler {
        hits: Arc<AtomicUsize>,
        response_config: ResponseConfig,
    }

    impl RequestHandler for GreetingHandler {
        fn handle(
            &self,
            _request: &DecodedRequest,
            sink: &dyn ResponseSink,
            cancel: &CancelToken,
        ) -> SwebResult<()> {
            let _ = self.hits.fetch_add(1, Ordering::AcqRel);
            sink.write_response(
                &encode_response(200, "OK", "text/plain", b"hello", &self.response_config),
                cancel,
            )
        }
    }

    struct TunnelHandler {
        hits: Arc<AtomicUsize>,
    }

    impl RequestHandler for TunnelHandler {
        fn handle(
            &self,
            request: &DecodedRequest,
            sink: &dyn ResponseSink,
            cancel: &CancelToken,
        ) -> SwebResult<()> {
            let _ = self.hits.fetch_add(1, Ordering::AcqRel);
            if request.method.is_tunnel() {
                sink.write_response(b"HTTP/1.1 200 Connection Established\r\n\r\n", cancel)?;
                let deadline = Instant::now() + Duration::from_secs(5);
                while !cancel.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(())
        }
    }

    struct TestServer {
        addr: std::net::SocketAddr,
        registry: Arc<ConnectionRegistry>,
        handle: super::ShutdownHandle,
        listen_thread: std::thread::JoinHandle<SwebResult<()>>,
    }

    fn start_server(config: ServerConfig, handler: Arc<dyn RequestHandler>) -> TestServer {
        let mut server = HttpServer::new(config, None, None, handler).with_pid_path(
            std::env::temp_dir().join(format!(
                "sweb-test-{}-{:?}.pid",
                std::process::id(),
                std::thread::current().id()
            )),
        );
        assert_that!(server.create_on(0), eq(true));
        let addr = server.local_addr().expect("bound addr should be available");
        let registry = Arc::clone(
            &server
                .created
                .as_ref()
                .expect("server should be created")
                .registry,
        );
        let handle = server
            .shutdown_handle()
            .expect("shutdown handle should exist");
        let listen_thread = std::thread::spawn(move || server.listen());
        TestServer {
            addr,
            registry,
            handle,
            listen_thread,
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            idle_timeout_ms: 0,
            disable_cookie: Some(false),
            reaper_period: Duration::from_millis(20),
            ..ServerConfig::default()
        }
    }

    fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let stop_at = Instant::now() + deadline;
        while Instant::now() < stop_at {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        check()
    }

    fn read_response(client: &mut TcpStream, needle: &[u8]) -> Vec<u8> {
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("read timeout should be configurable");
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut received = Vec::new();
        let mut chunk = [0_u8; 512];
        while Instant::now() < deadline {
            match client.read(&mut chunk) {
                Ok(0) => break,
                Ok(read_len) => {
                    received.extend_from_slice(&chunk[..read_len]);
                    if received
                        .windows(needle.len())
                        .any(|window| window == needle)
                    {
                        break;
                    }
                }
                Err(error)
                    if error.kind() == std::io::ErrorKind::WouldBlock
                        || error.kind() == std::io::ErrorKind::TimedOut => {}
                Err(error) => panic!("read from client failed: {error}"),
            }
        }
        received
    }

    #[rstest]
    fn server_executes_minimal_request_roundtrip() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = start_server(
            test_config(),
            Arc::new(GreetingHandler {
                hits: Arc::clone(&hits),
                response_config: ResponseConfig::default(),
            }),
        );

        let mut client = TcpStream::connect(server.addr).expect("connect should succeed");
        client
            .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .expect("request write should succeed");

        let response = read_response(&mut client, b"hello");
        assert_that!(
            response.starts_with(b"HTTP/1.1 200 OK\r\n"),
            eq(true)
        );
        assert_that!(hits.load(Ordering::Acquire), eq(1_usize));
        assert_that!(
            wait_until(Duration::from_secs(2), || {
                server.registry.active_task_count() == 0
            }),
            eq(true)
        );
        assert_that!(server.registry.connection_count(), eq(1_usize));

        server.handle.destroy();
        server
            .listen_thread
            .join()
            .expect("listen thread should stop")
            .expect("listen should exit cleanly");
    }

    #[rstest]
    fn tunneled_connection_dispatches_exactly_one_task() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = start_server(
            test_config(),
            Arc::new(TunnelHandler {
                hits: Arc::clone(&hits),
            }),
        );

        let mut client = TcpStream::connect(server.addr).expect("connect should succeed");
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .expect("connect request write should succeed");
        let response = read_response(&mut client, b"Connection Established");
        assert_that!(response.is_empty(), eq(false));

        client
            .write_all(b"GET /late HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .expect("follow-up write should succeed");
        std::thread::sleep(Duration::from_millis(150));

        assert_that!(hits.load(Ordering::Acquire), eq(1_usize));
        assert_that!(server.registry.active_task_count(), eq(1_usize));

        server.handle.destroy();
        server
            .listen_thread
            .join()
            .expect("listen thread should stop")
            .expect("listen should exit cleanly");
    }

    #[rstest]
    fn idle_connection_is_reaped_after_the_timeout() {
        let hits = Arc::new(AtomicUsize::new(0));
        let config = ServerConfig {
            idle_timeout_ms: 80,
            ..test_config()
        };
        let server = start_server(
            config,
            Arc::new(GreetingHandler {
                hits,
                response_config: ResponseConfig::default(),
            }),
        );

        let mut client = TcpStream::connect(server.addr).expect("connect should succeed");
        assert_that!(
            wait_until(Duration::from_secs(2), || {
                server.registry.connection_count() == 1
            }),
            eq(true)
        );

        assert_that!(
            wait_until(Duration::from_secs(2), || {
                server.registry.connection_count() == 0
            }),
            eq(true)
        );
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .expect("read timeout should be configurable");
        let mut chunk = [0_u8; 8];
        let read_len = client
            .read(&mut chunk)
            .expect("reaped peer read should succeed");
        assert_that!(read_len, eq(0_usize));

        server.handle.destroy();
        server
            .listen_thread
            .join()
            .expect("listen thread should stop")
            .expect("listen should exit cleanly");
    }

    #[rstest]
    fn destroy_twice_is_a_no_op() {
        let hits = Arc::new(AtomicUsize::new(0));
        let server = start_server(
            test_config(),
            Arc::new(GreetingHandler {
                hits,
                response_config: ResponseConfig::default(),
            }),
        );

        server.handle.destroy();
        server.handle.destroy();

        server
            .listen_thread
            .join()
            .expect("listen thread should stop")
            .expect("listen should exit cleanly");
        server.handle.destroy();
    }

    #[rstest]
    fn create_on_an_occupied_port_fails_without_partial_state() {
        let blocker = std::net::TcpListener::bind(("127.0.0.1", 0))
            .expect("blocker listener should bind");
        let occupied_port = blocker
            .local_addr()
            .expect("blocker addr should be available")
            .port();

        let hits = Arc::new(AtomicUsize::new(0));
        let mut server = HttpServer::new(
            test_config(),
            None,
            None,
            Arc::new(GreetingHandler {
                hits,
                response_config: ResponseConfig::default(),
            }),
        );

        assert_that!(server.create_on(occupied_port), eq(false));
        assert_that!(server.local_addr().is_err(), eq(true));
        assert_that!(server.listen().is_err(), eq(true));
    }

    #[rstest]
    fn listen_without_create_is_an_error() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut server = HttpServer::new(
            test_config(),
            None,
            None,
            Arc::new(GreetingHandler {
                hits,
                response_config: ResponseConfig::default(),
            }),
        );

        assert_that!(server.listen().is_err(), eq(true));
    }
}
