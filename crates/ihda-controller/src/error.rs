use thiserror::Error;

/// Error taxonomy for every fallible driver entry point.
///
/// Resource exhaustion and malformed input are per-call failures the caller
/// may retry or correct; `Io` and `Timeout` report hardware/transport faults.
/// Programming-invariant violations are asserted, never returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HdaError {
    /// No free stream context, tag, or ring slot. Retryable.
    #[error("resource unavailable")]
    Unavailable,

    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),

    /// Register window or channel transport fault.
    #[error("I/O failure: {0}")]
    Io(&'static str),

    #[error("operation not permitted in current state: {0}")]
    BadState(&'static str),

    /// A bounded hardware handshake did not complete.
    #[error("hardware handshake timed out: {0}")]
    Timeout(&'static str),

    #[error("contiguous DMA allocation failed")]
    NoMemory,

    /// The peer end of a client channel went away.
    #[error("channel peer closed")]
    PeerClosed,
}

pub type Result<T> = std::result::Result<T, HdaError>;
