//! Idle-connection reaper bounding resource retention.
//!
//! Runs on a fixed short period. Each sweep removes registry entries idle past the configured
//! timeout, cancelling their handler tasks and closing their sockets. A disabled timeout means
//! "no timeout enforced", not an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::decode::DecoderTable;
use crate::dispatch::ConnectionRegistry;
use crate::network::SelectorHandle;

/// Periodic sweep over the connection registry and pending decode state.
#[derive(Debug)]
pub(crate) struct TimeoutReaper {
    registry: Arc<ConnectionRegistry>,
    decoders: Arc<DecoderTable>,
    selector: SelectorHandle,
    idle_timeout: Option<Duration>,
}

impl TimeoutReaper {
    pub(crate) fn new(
        registry: Arc<ConnectionRegistry>,
        decoders: Arc<DecoderTable>,
        selector: SelectorHandle,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            decoders,
            selector,
            idle_timeout,
        }
    }

    /// One sweep. Returns promptly when reaping is disabled or nothing expired.
    pub(crate) fn tick(&self) {
        let Some(idle_timeout) = self.idle_timeout else {
            return;
        };
        let reaped = self.registry.collect_expired(idle_timeout, Instant::now());
        for id in reaped {
            self.decoders.remove(id);
            self.selector.retire(id);
            info!(
                connection = id,
                "closed connection idle past {}ms",
                idle_timeout.as_millis()
            );
        }
    }
}
