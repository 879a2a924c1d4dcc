//! Scoped, priority-driven replication of domain objects (component D).

mod manager;
mod record;

pub use manager::{GhostManager, GhostRef};
pub use record::{ChainEntry, GhostFlags, GhostRecord};
