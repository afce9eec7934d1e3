//! Server, request, and response configuration resolved during bootstrap.
//!
//! Explicit field values always win; fields left at their "unset" marker are filled from the
//! process environment and finally from built-in defaults. Configuration is immutable once the
//! listener starts.

use std::fmt;
use std::time::Duration;

use crate::ids::WorkerCount;

/// Environment variable consulted when `ServerConfig::port` is left at `0`.
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";
/// Environment variable consulted when `ServerConfig::idle_timeout_ms` is left at `0`.
pub const ENV_SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";
/// Environment variable consulted when `ServerConfig::disable_cookie` is unset.
pub const ENV_SERVER_DISABLE_COOKIE: &str = "SERVER_DISABLE_COOKIE";

const DEFAULT_PORT: u16 = 6058;
const DEFAULT_WORKER_COUNT: u16 = 4;
const DEFAULT_WORKER_QUEUE_LIMIT: usize = 64;
const DEFAULT_DISPATCH_QUEUE_LIMIT: usize = 256;
const DEFAULT_DECODE_PERIOD_MS: u64 = 1;
const DEFAULT_REAPER_PERIOD_MS: u64 = 100;

/// Route table carried in configuration.
///
/// The server core consults this only for startup logging; route matching belongs to the
/// handler collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Router {
    routes: Vec<(String, String)>,
}

impl Router {
    /// Adds one `path -> handler name` entry.
    #[must_use]
    pub fn route(mut self, path: impl Into<String>, handler_name: impl Into<String>) -> Self {
        self.routes.push((path.into(), handler_name.into()));
        self
    }

    /// Returns `true` when no routes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Display for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (path, name) in &self.routes {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{path} -> {name}")?;
            first = false;
        }
        Ok(())
    }
}

/// Bootstrap configuration consumed by the server lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Bind address for the listener.
    pub host: String,
    /// Bind port. `0` means "resolve from the environment, then the default port".
    pub port: u16,
    /// Idle timeout in milliseconds. `0` means "resolve from the environment"; a still-zero
    /// value after resolution disables idle reaping entirely.
    pub idle_timeout_ms: u64,
    /// Whether cookie emission is disabled. `None` means "resolve from the environment".
    pub disable_cookie: Option<bool>,
    /// Whether the listener terminates TLS. Channel adaptation itself is external; the flag is
    /// propagated into request defaults.
    pub ssl: bool,
    /// Number of handler worker threads.
    pub worker_count: WorkerCount,
    /// Per-worker cap on queued plus in-flight handler tasks.
    pub worker_queue_limit: usize,
    /// Capacity of the decode-to-dispatch hand-off queue.
    pub dispatch_queue_limit: usize,
    /// Decode stage polling period.
    pub decode_period: Duration,
    /// Idle reaper sweep period.
    pub reaper_period: Duration,
    /// Route table, consulted for startup logging only.
    pub router: Router,
    /// Interceptor names, consulted for startup logging only.
    pub interceptors: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            idle_timeout_ms: 0,
            disable_cookie: None,
            ssl: false,
            worker_count: WorkerCount::new(DEFAULT_WORKER_COUNT)
                .expect("literal worker count must be non-zero"),
            worker_queue_limit: DEFAULT_WORKER_QUEUE_LIMIT,
            dispatch_queue_limit: DEFAULT_DISPATCH_QUEUE_LIMIT,
            decode_period: Duration::from_millis(DEFAULT_DECODE_PERIOD_MS),
            reaper_period: Duration::from_millis(DEFAULT_REAPER_PERIOD_MS),
            router: Router::default(),
            interceptors: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Fills unset fields from the process environment, then from built-in defaults.
    #[must_use]
    pub fn resolved(self) -> Self {
        self.resolved_with(|name| std::env::var(name).ok())
    }

    /// Environment resolution against an arbitrary lookup, so callers and tests can inject
    /// their own source.
    #[must_use]
    pub fn resolved_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.port == 0 {
            self.port = lookup(ENV_SERVER_PORT)
                .and_then(|value| value.trim().parse::<u16>().ok())
                .filter(|port| *port != 0)
                .unwrap_or(DEFAULT_PORT);
        }
        if self.idle_timeout_ms == 0
            && let Some(value) = lookup(ENV_SERVER_TIMEOUT)
            && let Ok(timeout_ms) = value.trim().parse::<u64>()
        {
            self.idle_timeout_ms = timeout_ms;
        }
        if self.disable_cookie.is_none() {
            let from_env = lookup(ENV_SERVER_DISABLE_COOKIE)
                .map(|value| value.trim().eq_ignore_ascii_case("true"));
            self.disable_cookie = Some(from_env.unwrap_or(false));
        }
        self
    }

    /// Effective idle timeout; `None` means reaping is disabled, not an error.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        if self.idle_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.idle_timeout_ms))
        }
    }

    /// Effective cookie-suppression flag.
    #[must_use]
    pub fn disable_cookie(&self) -> bool {
        self.disable_cookie.unwrap_or(false)
    }

    /// Builds the request defaults derived from this server configuration.
    #[must_use]
    pub fn derived_request_config(&self) -> RequestConfig {
        RequestConfig {
            disable_cookie: self.disable_cookie(),
            ssl: self.ssl,
            router: self.router.clone(),
        }
    }

    /// Builds the response defaults derived from this server configuration.
    #[must_use]
    pub fn derived_response_config(&self) -> ResponseConfig {
        ResponseConfig {
            charset: "UTF-8".to_string(),
            gzip: false,
            disable_cookie: self.disable_cookie(),
        }
    }
}

/// Per-request defaults handed to the handler collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestConfig {
    /// Whether cookie parsing/emission is disabled for requests.
    pub disable_cookie: bool,
    /// Whether requests arrive over a TLS-terminated channel.
    pub ssl: bool,
    /// Route table forwarded to the handler collaborator.
    pub router: Router,
}

/// Per-response defaults handed to the handler collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseConfig {
    /// Charset appended to text content types.
    pub charset: String,
    /// Whether handlers should gzip response bodies. Carried for collaborators; the core never
    /// compresses.
    pub gzip: bool,
    /// Whether cookie emission is disabled for responses.
    pub disable_cookie: bool,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            charset: "UTF-8".to_string(),
            gzip: false,
            disable_cookie: false,
        }
    }
}
