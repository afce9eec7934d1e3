//! Embeddable non-blocking HTTP server core.
//!
//! One readiness-multiplexing loop accepts connections and forwards readable sockets to a
//! short-period decode stage; completed requests flow through a parking dispatch loop into a
//! bounded worker pool, while a periodic reaper closes connections idle past the configured
//! timeout. Request framing and business logic are collaborators supplied by the embedder
//! (`sweb-http`).

pub mod app;
pub mod channel;
pub mod dispatch;

mod decode;
mod network;
mod reaper;
mod schedule;
mod worker;
