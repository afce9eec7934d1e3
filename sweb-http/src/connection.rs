//! Connection-scoped decoder state for the request framing collaborator.
//!
//! A decoder keeps unread bytes in a buffer and repeatedly tries to extract complete requests
//! as new network chunks arrive. Partial progress is never discarded; the buffer simply waits
//! for the next readiness event on the same connection.

use sweb_common::error::SwebResult;

use crate::protocol::{DecodedRequest, ParseLimits, ParseStatus, parse_next_request};

/// Incremental request decoder driven by socket-readiness notifications.
///
/// Implementations must never block and must preserve partial state across calls for the same
/// connection.
pub trait RequestDecoder: Send {
    /// Appends newly received network bytes into the decoder buffer.
    fn feed_bytes(&mut self, bytes: &[u8]);

    /// Tries to decode one request from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are required.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::Protocol` when buffered bytes violate request framing rules.
    fn try_pop_request(&mut self) -> SwebResult<Option<DecodedRequest>>;

    /// Returns the number of pending bytes still waiting to be decoded.
    fn pending_bytes(&self) -> usize;
}

/// Factory producing one fresh decoder per connection.
pub type DecoderFactory = dyn Fn() -> Box<dyn RequestDecoder> + Send + Sync;

/// Default `RequestDecoder` implementation backed by the built-in framing parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpDecodeState {
    read_buffer: Vec<u8>,
    limits: ParseLimits,
}

impl HttpDecodeState {
    /// Creates a decoder with default framing limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(ParseLimits::default())
    }

    /// Creates a decoder with explicit framing limits.
    #[must_use]
    pub fn with_limits(limits: ParseLimits) -> Self {
        Self {
            read_buffer: Vec::new(),
            limits,
        }
    }
}

impl Default for HttpDecodeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestDecoder for HttpDecodeState {
    fn feed_bytes(&mut self, bytes: &[u8]) {
        self.read_buffer.extend_from_slice(bytes);
    }

    fn try_pop_request(&mut self) -> SwebResult<Option<DecodedRequest>> {
        match parse_next_request(&self.read_buffer, &self.limits)? {
            ParseStatus::Incomplete => Ok(None),
            ParseStatus::Complete { request, consumed } => {
                self.read_buffer.drain(..consumed);
                Ok(Some(request))
            }
        }
    }

    fn pending_bytes(&self) -> usize {
        self.read_buffer.len()
    }
}
