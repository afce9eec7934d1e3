//! Shared error model for cross-crate APIs.

use thiserror::Error;

/// Unified result type used by all public interfaces in `sweb`.
pub type SwebResult<T> = Result<T, SwebError>;

/// High-level error categories shared by the server core and its collaborators.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwebError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Client request bytes are malformed or semantically invalid.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A bounded executor or queue rejected new work.
    #[error("capacity exhausted: {0}")]
    Capacity(String),

    /// Socket or filesystem I/O failed.
    #[error("io error: {0}")]
    Io(String),
}
