//! Shared error plumbing. Every layer - bit stream, notify protocol, event
//! channel, ghost manager, connection - reports through the same two-shaped
//! result: `Wait` for "try again, this is not fatal" and `Fatal(reason)` for
//! "tear the connection down".

use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// A non-fatal `Wait` is the bit-stream/packing equivalent of `WouldBlock`:
/// the caller should stop what it is doing and retry later, with no state
/// corruption. Everything else is `Fatal` and ends the connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum NetError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum ErrorType {
    /// A field's state bit referenced a bit position with no declared field.
    UnknownStateBit,
    /// Two fields in the same type chain claimed the same state bit.
    DuplicateStateBit,
    /// `find_type` was asked to decode a class index with no registration.
    UnknownClass,
    /// A decoded ghost index fell outside `[0, max_ghosts)`.
    GhostIndexOutOfRange,
    /// RPC dispatched against the wrong direction (client-only on the
    /// server, or vice versa).
    IllegalRpc,
    /// `on_ghost_add` refused the incoming ghost.
    GhostAddFailed,
    /// No traffic from the peer within the timeout window.
    TimedOut,
    /// A decoded frame violated the wire contract (bad bit width, truncated
    /// continuation list, mask bit for an unknown field, ...).
    ProtocolError,
    Io(io::ErrorKind),
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

/// Distinguishes "nothing went wrong, but also nothing happened" from an
/// actual failure.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(NetError::Wait))
    }
}
