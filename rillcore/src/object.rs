//! Replicated object model: the data every ghostable domain object carries,
//! plus the hook traits a ghost manager calls into (spec section 4.4 and
//! the original's `net_object`/`net_connection::prepare_write_packet`
//! scope-query pair).

use crate::reflect::TypeHandle;
use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Stable, process-wide identity for a replicated object. Distinct from a
/// ghost index, which is per-connection and reassigned as ghosts come and
/// go; `ObjectId` is what a ghost's create record ultimately resolves back
/// to on the owning side.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct ObjectId(pub u64);

/// Identifies one live connection. Ghost records, scope queries and RPC
/// dispatch are all keyed by this.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ConnectionId(pub u32);

/// Ghostable objects are shared between the code that owns them and the
/// ghost manager via `Rc<RefCell<_>>` - single-threaded cooperative model,
/// no locks needed. `dyn GhostHooks` rather than `dyn ReplicatedObject`
/// because anything the ghost manager touches needs the lifecycle hooks,
/// not just field encoding.
pub type ObjectRef = Rc<RefCell<dyn GhostHooks>>;
pub type WeakObjectRef = Weak<RefCell<dyn GhostHooks>>;

/// A domain object that can be mirrored across the wire. Field-level
/// encoding is handled by the type database (`reflect.rs`); this trait
/// supplies identity, the dirty mask and the `Any` downcast the reflect
/// layer's function pointers need.
pub trait ReplicatedObject: Any {
    fn type_handle(&self) -> TypeHandle;
    fn object_id(&self) -> ObjectId;

    /// Bits set here are fields that changed since they were last written
    /// to every connection that already holds this object's ghost.
    fn dirty_mask(&self) -> u32;
    fn mark_clean(&mut self, bits: u32);
    fn mark_dirty(&mut self, bits: u32);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Hooks a ghost manager calls into over a ghost's lifetime. All have
/// inert defaults; a type only overrides the ones it cares about.
#[allow(unused_variables)]
pub trait GhostHooks: ReplicatedObject {
    /// Called on the receiving side right after the first update for a new
    /// ghost has been read. Returning `false` fails the whole connection
    /// (`GhostAddFailed`) - use this for "this object type cannot exist
    /// without field X set", not for soft validation.
    fn on_ghost_add(&mut self, connection: ConnectionId) -> bool {
        true
    }

    /// Called on the receiving side when the source drops this ghost from
    /// scope or the connection closes.
    fn on_ghost_remove(&mut self, connection: ConnectionId) {}

    /// Called on the receiving side after any update past the first.
    fn on_ghost_update(&mut self, connection: ConnectionId, mask: u32) {}

    /// Called on the *sending* side once this object's ghost has finished
    /// its initial update and is fully available to `connection`.
    fn on_ghost_available(&mut self, connection: ConnectionId) {}

    /// Scores how urgently `mask` should be sent to `connection`, given
    /// `skip_count` prior ticks where it lost the packing competition.
    /// Default mirrors the original's "priority grows with how long it's
    /// been skipped": callers compare scores, not absolute magnitudes.
    fn update_priority(&self, connection: ConnectionId, mask: u32, skip_count: u32) -> f32 {
        let _ = (connection, mask);
        skip_count as f32 + 1.0
    }
}

/// A connection-side callback for scope queries: every object the source
/// wants in scope for the querying connection is reported through this.
pub trait ScopeQuery {
    fn object_in_scope(&mut self, object: &ObjectRef);
}

/// Implemented by whatever owns the set of objects that might be in scope
/// for a connection (a world, a zone manager, ...). `perform_scope_query`
/// is called once per tick per connection before ghost packing.
pub trait ScopeSource {
    fn perform_scope_query(&mut self, connection: ConnectionId, query: &mut dyn ScopeQuery);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeHandle;

    struct Dummy {
        dirty: u32,
    }

    impl ReplicatedObject for Dummy {
        fn type_handle(&self) -> TypeHandle {
            TypeHandle(0)
        }
        fn object_id(&self) -> ObjectId {
            ObjectId(1)
        }
        fn dirty_mask(&self) -> u32 {
            self.dirty
        }
        fn mark_clean(&mut self, bits: u32) {
            self.dirty &= !bits;
        }
        fn mark_dirty(&mut self, bits: u32) {
            self.dirty |= bits;
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    impl GhostHooks for Dummy {}

    #[test]
    fn default_priority_grows_with_skip_count() {
        let obj = Dummy { dirty: 0 };
        let low = obj.update_priority(ConnectionId(0), 1, 0);
        let high = obj.update_priority(ConnectionId(0), 1, 5);
        assert!(high > low);
    }

    #[test]
    fn mark_dirty_and_clean_round_trip() {
        let mut obj = Dummy { dirty: 0 };
        obj.mark_dirty(0b101);
        assert_eq!(obj.dirty_mask(), 0b101);
        obj.mark_clean(0b001);
        assert_eq!(obj.dirty_mask(), 0b100);
    }
}
