//! Common imports for a crate built on top of `rillcore`. `use rillcore::prelude::*;`
//! pulls in the pieces an application actually touches; the module paths
//! themselves stay available for anything more specific.

pub use crate::bitstream::{BitReader, BitWriter};
pub use crate::config::Config;
pub use crate::connection::{Connection, ConnectionState};
pub use crate::error::{ErrorType, ErrorUtils, NetError, NetResult};
pub use crate::event::{Direction, Discipline, EventChannel, EventRef};
pub use crate::ghost::{GhostManager, GhostRef};
pub use crate::interface::{ConnectionChange, Interface};
pub use crate::logging::Logger;
pub use crate::notify::{Fate, Notify, NotifyHeader};
pub use crate::object::{ConnectionId, GhostHooks, ObjectId, ObjectRef, ReplicatedObject, ScopeQuery, ScopeSource, WeakObjectRef};
pub use crate::reflect::{FieldDescriptor, TypeDescriptor, TypeHandle};
pub use crate::socket::{Socket, SocketEvent};
pub use rillcore_proc::Replicated;
