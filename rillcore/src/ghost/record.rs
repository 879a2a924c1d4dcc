//! Per-ghost bookkeeping: status flags and the chain of not-yet-resolved
//! writes a record has sent, used to recompute what was actually lost when
//! a notify entry comes back as lost (spec section 4.4's "walking
//! subsequent ref-chain entries").

use crate::object::{ObjectId, WeakObjectRef};
use std::collections::VecDeque;

/// Mirrors the original engine's ghost status bits. `not_yet_ghosted`,
/// `ghosting`, `kill_ghost` and `killing_ghost` are mutually exclusive
/// "in flight" states; `in_scope` and `scope_local_always` are independent
/// of them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct GhostFlags {
    pub in_scope: bool,
    pub scope_local_always: bool,
    pub not_yet_ghosted: bool,
    pub ghosting: bool,
    pub kill_ghost: bool,
    pub killing_ghost: bool,
}

impl GhostFlags {
    /// True once a destroy has been requested for this record, whether or
    /// not its delivery has been acked yet. `mark_dirty` uses this to stop
    /// accumulating field updates for an object that's on its way out.
    pub fn is_being_destroyed(&self) -> bool {
        self.kill_ghost || self.killing_ghost
    }
}

/// One write this record has sent whose delivery status is still unknown.
/// Recorded in send order; FIFO notify resolution means the entry being
/// resolved is always at the front of this chain.
#[derive(Copy, Clone, Debug)]
pub struct ChainEntry {
    pub write_mask: u32,
    pub is_create: bool,
    pub is_destroy: bool,
}

pub struct GhostRecord {
    pub ghost_index: u16,
    pub array_index: usize,
    pub object_id: ObjectId,
    pub object: WeakObjectRef,
    pub flags: GhostFlags,
    pub dirty_mask: u32,
    pub update_skip_count: u32,
    pub chain: VecDeque<ChainEntry>,
}

impl GhostRecord {
    pub fn new(ghost_index: u16, array_index: usize, object_id: ObjectId, object: WeakObjectRef) -> GhostRecord {
        GhostRecord {
            ghost_index,
            array_index,
            object_id,
            object,
            flags: GhostFlags {
                not_yet_ghosted: true,
                in_scope: true,
                ..GhostFlags::default()
            },
            dirty_mask: u32::MAX,
            update_skip_count: 0,
            chain: VecDeque::new(),
        }
    }
}
