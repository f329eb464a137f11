//! Application-visible error kinds.

use thiserror::Error;

/// Errors surfaced by the datapath and session-lifecycle APIs.
///
/// Packet loss and peer slowness are recovered internally and never surface
/// here; internal invariant violations panic instead of returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Message exceeds the maximum size expressible on the wire.
    #[error("message too large")]
    TooLarge,

    /// The buffer pool could not be extended.
    #[error("out of buffer memory")]
    OutOfMemory,

    /// The per-instance session cap has been reached.
    #[error("too many sessions")]
    TooManySessions,

    /// The remote peer rejected the session request.
    #[error("invalid remote Rpc ID")]
    InvalidRemoteRpcId,

    /// The peer died or explicitly reset the session. Delivered to every
    /// in-flight continuation on the affected session.
    #[error("session reset")]
    SessionReset,

    /// The session is in teardown and cannot carry new requests.
    #[error("session disconnected")]
    Disconnected,

    /// The transmission queue is full; retry after the next event-loop tick.
    #[error("transmit ring exhausted")]
    RingExhausted,

    /// The given session number does not refer to a usable session.
    #[error("invalid session number")]
    InvalidSession,
}

/// Result type of fallible `uddrpc` operations.
pub type Result<T> = std::result::Result<T, Error>;
