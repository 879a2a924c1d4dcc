//! Reliable, connection-oriented game networking over an unreliable
//! datagram transport.
//!
//! The crate is organized the way the original engine split its
//! networking core into independently testable pieces: a type database and
//! bit stream underneath everything (`reflect`, `bitstream`), a sliding
//! delivery-status window (`notify`), an RPC/event channel built on top of
//! it (`event`), scoped priority-driven object replication built on top of
//! that (`ghost`), and a connection state machine plus socket abstraction
//! tying all four together (`connection`, `socket`, `interface`).

pub mod bitstream;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod ghost;
pub mod interface;
pub mod logging;
pub mod notify;
pub mod object;
pub mod reflect;
pub mod socket;

pub mod prelude;

pub use lazy_static::lazy_static;
pub use rillcore_proc::Replicated;
