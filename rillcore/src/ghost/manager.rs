//! Ghost manager (component D): per-connection scoped, priority-driven
//! replication of domain objects. Owns both halves of one connection's
//! ghosting - the source-side table of objects this side is ghosting out,
//! and the mirror-side table of objects read in from the peer.

use super::record::{ChainEntry, GhostFlags, GhostRecord};
use crate::bitstream::{BitReader, BitWriter};
use crate::error::{ErrorType, NetError, NetResult};
use crate::notify::{Fate, GhostNotifyHandler};
use crate::object::{ConnectionId, GhostHooks, ObjectId, ObjectRef, ScopeQuery, ScopeSource};
use crate::reflect::{self, TypeHandle};
use hashbrown::HashMap;
use std::rc::Rc;

/// A destroy is always packed ahead of any update, regardless of how long
/// other records have been starved.
const DESTROY_PRIORITY: f32 = 1.0e9;

/// Carried on a `NotifyEntry` for one packed ghost write, enough to find
/// the record again on delivery/loss.
#[derive(Copy, Clone, Debug)]
pub struct GhostRef {
    ghost_index: u16,
}

/// What `pack_one` actually wrote, if anything. Destroy gets its own
/// variant rather than overloading `Wrote`'s mask - unlike a create/update,
/// a destroy has no write mask to speak of, but it still needs `pack` to
/// push a `GhostRef` and run `after_write` just as much as a write does.
enum PackOutcome {
    Wrote(u32),
    Destroyed,
    /// The object was already gone by the time this record came up; there
    /// was nothing to write and nothing to track delivery for.
    Gone,
}

struct RemoteGhost {
    type_handle: TypeHandle,
    object: Box<dyn GhostHooks>,
}

/// Forwards `object_in_scope` calls into the manager: existing records
/// get `in_scope` re-set, objects with no record yet get a fresh one
/// allocated from the free region.
struct ScopeCollector<'a> {
    manager: &'a mut GhostManager,
}

impl<'a> ScopeQuery for ScopeCollector<'a> {
    fn object_in_scope(&mut self, object: &ObjectRef) {
        let object_id = object.borrow().object_id();
        match self.manager.by_object.get(&object_id) {
            Some(&idx) => {
                self.manager.slot_mut(idx).flags.in_scope = true;
            }
            None => {
                self.manager.allocate(object_id, Rc::downgrade(object));
            }
        }
    }
}

pub struct GhostManager {
    max_ghosts: usize,
    min_padding_bits: usize,

    // Source-side state: this connection's outgoing ghost table.
    order: Vec<u16>,
    slots: Vec<Option<GhostRecord>>,
    zero_update_index: usize,
    free_index: usize,
    by_object: HashMap<ObjectId, u16>,

    // Mirror-side state: objects read in from the peer.
    remote: Vec<Option<RemoteGhost>>,

    ghosting: bool,
    session_id: u32,
}

impl GhostManager {
    pub fn new(max_ghosts: usize, min_padding_bits: usize) -> GhostManager {
        let order = (0..max_ghosts as u16).collect();
        GhostManager {
            max_ghosts,
            min_padding_bits,
            order,
            slots: (0..max_ghosts).map(|_| None).collect(),
            zero_update_index: 0,
            free_index: 0,
            by_object: HashMap::new(),
            remote: (0..max_ghosts).map(|_| None).collect(),
            ghosting: false,
            session_id: 0,
        }
    }

    #[inline]
    fn slot_mut(&mut self, ghost_index: u16) -> &mut GhostRecord {
        self.slots[ghost_index as usize].as_mut().expect("ghost index must resolve to a live record")
    }

    fn swap_positions(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.order.swap(a, b);
        let idx_a = self.order[a];
        let idx_b = self.order[b];
        if let Some(rec) = self.slots[idx_a as usize].as_mut() {
            rec.array_index = a;
        }
        if let Some(rec) = self.slots[idx_b as usize].as_mut() {
            rec.array_index = b;
        }
    }

    /// Promotes the slot at `free_index` straight into the dirty region,
    /// returning its ghost index. Caller must have already confirmed a
    /// free slot exists (`free_index < max_ghosts`).
    fn promote_free_to_dirty(&mut self) -> u16 {
        let ghost_index = self.order[self.free_index];
        self.swap_positions(self.zero_update_index, self.free_index);
        self.zero_update_index += 1;
        self.free_index += 1;
        ghost_index
    }

    /// Moves the record at array position `p` (currently idle) to the
    /// front of the dirty region.
    fn promote_idle_to_dirty(&mut self, p: usize) {
        self.swap_positions(p, self.zero_update_index);
        self.zero_update_index += 1;
    }

    /// Moves the record at array position `p` (currently dirty) to the
    /// start of the idle region.
    fn demote_dirty_to_idle(&mut self, p: usize) {
        self.zero_update_index -= 1;
        self.swap_positions(p, self.zero_update_index);
    }

    /// Removes the record at array position `p` (dirty or idle) entirely,
    /// returning it to the free region.
    fn demote_to_free(&mut self, mut p: usize) {
        if p < self.zero_update_index {
            self.zero_update_index -= 1;
            self.swap_positions(p, self.zero_update_index);
            p = self.zero_update_index;
        }
        self.free_index -= 1;
        self.swap_positions(p, self.free_index);
    }

    fn allocate(&mut self, object_id: ObjectId, weak: crate::object::WeakObjectRef) -> Option<u16> {
        if self.free_index >= self.max_ghosts {
            return None;
        }
        let ghost_index = self.promote_free_to_dirty();
        let array_index = self.slots_array_index_of(ghost_index);
        self.slots[ghost_index as usize] = Some(GhostRecord::new(ghost_index, array_index, object_id, weak));
        self.by_object.insert(object_id, ghost_index);
        Some(ghost_index)
    }

    fn slots_array_index_of(&self, ghost_index: u16) -> usize {
        self.order.iter().position(|&g| g == ghost_index).expect("ghost index must be present in the order array")
    }

    pub fn activate_ghosting(&mut self) -> u32 {
        self.session_id = self.session_id.wrapping_add(1);
        self.session_id
    }

    pub fn confirm_ghosting(&mut self, session_id: u32) -> bool {
        if session_id == self.session_id {
            self.ghosting = true;
            true
        } else {
            false
        }
    }

    /// Clears every source-side record and bumps the session id, per the
    /// `reset_ghosting` contract; an end-ghosting message is the caller's
    /// responsibility to send.
    pub fn reset_ghosting(&mut self) {
        self.ghosting = false;
        self.session_id = self.session_id.wrapping_add(1);
        self.order = (0..self.max_ghosts as u16).collect();
        self.slots = (0..self.max_ghosts).map(|_| None).collect();
        self.zero_update_index = 0;
        self.free_index = 0;
        self.by_object.clear();
    }

    #[inline]
    pub fn is_ghosting(&self) -> bool {
        self.ghosting
    }

    /// Folds newly-dirtied bits into the record tracking `object_id`, if
    /// this connection currently ghosts it, promoting it back into the
    /// dirty region when it was idle. The original engine pushes this
    /// straight from `net_object::set_dirty` through an intrusive
    /// back-reference list on the object; here the caller (the connection
    /// driving this manager) is expected to forward it explicitly once it
    /// observes `ReplicatedObject::dirty_mask()` go non-zero.
    pub fn mark_dirty(&mut self, object_id: ObjectId, bits: u32) {
        let ghost_index = match self.by_object.get(&object_id) {
            Some(&idx) => idx,
            None => return,
        };
        let record = self.slots[ghost_index as usize].as_mut().unwrap();
        if record.flags.is_being_destroyed() {
            // Nothing left to reach once the destroy itself has been
            // requested; its own chain entry already carries an all-ones
            // mask to the wire.
            return;
        }
        let was_idle = record.dirty_mask == 0 && !record.flags.not_yet_ghosted;
        record.dirty_mask |= bits;
        if was_idle && record.dirty_mask != 0 {
            let array_index = record.array_index;
            self.promote_idle_to_dirty(array_index);
        }
    }

    /// Write phase: scope query, scoring, packing. Returns the ghost refs
    /// to attach to this datagram's notify entry.
    pub fn pack(&mut self, stream: &mut BitWriter, scope: &mut dyn ScopeSource, connection: ConnectionId, ghost_index_bits: u32) -> NetResult<Vec<GhostRef>> {
        if !self.ghosting {
            stream.write_bool(false)?;
            return Ok(Vec::new());
        }

        // Every currently-dirty record ages by one tick and drops out of
        // scope unless pinned; the scope query below re-asserts whichever
        // ones are still visible.
        for i in 0..self.zero_update_index {
            let ghost_index = self.order[i];
            let record = self.slots[ghost_index as usize].as_mut().unwrap();
            record.update_skip_count += 1;
            if !record.flags.scope_local_always {
                record.flags.in_scope = false;
            }
        }

        let mut collector = ScopeCollector { manager: self };
        scope.perform_scope_query(connection, &mut collector);
        drop(collector);

        // Anything left dirty but now out of scope becomes a pending
        // destroy: flip it to kill_ghost with an all-ones mask so the
        // destroy bit itself gets transmitted as an update.
        let mut i = 0;
        while i < self.zero_update_index {
            let ghost_index = self.order[i];
            let flags = self.slots[ghost_index as usize].as_ref().unwrap().flags;
            if !flags.in_scope && !flags.kill_ghost && !flags.killing_ghost {
                let record = self.slots[ghost_index as usize].as_mut().unwrap();
                record.flags.kill_ghost = true;
                record.dirty_mask = u32::MAX;
            }
            i += 1;
        }

        stream.write_bool(true)?;
        stream.write_bits(ghost_index_bits - 3, 3)?;

        let mut candidates: Vec<u16> = (0..self.zero_update_index).map(|i| self.order[i]).collect();
        candidates.sort_by(|&a, &b| {
            let score_a = self.score(a);
            let score_b = self.score(b);
            score_b.partial_cmp(&score_a).unwrap()
        });

        let mut refs = Vec::new();
        for ghost_index in candidates {
            if stream.remaining_bits() < self.min_padding_bits {
                break;
            }
            if self.score(ghost_index) <= 0.0 {
                continue;
            }

            let mark = stream.mark();
            match self.pack_one(stream, ghost_index, ghost_index_bits) {
                Ok(PackOutcome::Wrote(write_mask)) => {
                    refs.push(GhostRef { ghost_index });
                    self.after_write(ghost_index, write_mask);
                }
                Ok(PackOutcome::Destroyed) => {
                    refs.push(GhostRef { ghost_index });
                    self.after_write(ghost_index, 0);
                }
                Ok(PackOutcome::Gone) => {}
                Err(NetError::Wait) => {
                    stream.rewind(mark);
                    break;
                }
                Err(fatal) => return Err(fatal),
            }
        }

        stream.write_bool(false)?; // continuation terminator
        Ok(refs)
    }

    fn score(&self, ghost_index: u16) -> f32 {
        let record = self.slots[ghost_index as usize].as_ref().unwrap();
        if record.flags.kill_ghost {
            return DESTROY_PRIORITY;
        }
        if record.flags.ghosting || record.flags.killing_ghost {
            return 0.0;
        }
        match record.object.upgrade() {
            Some(obj) => obj.borrow().update_priority(ConnectionId(0), record.dirty_mask, record.update_skip_count),
            None => DESTROY_PRIORITY,
        }
    }

    /// Writes one ghost record's header and body.
    fn pack_one(&mut self, stream: &mut BitWriter, ghost_index: u16, ghost_index_bits: u32) -> NetResult<PackOutcome> {
        let record = self.slots[ghost_index as usize].as_ref().unwrap();

        stream.write_bool(true)?; // continuation: one more record follows
        stream.write_bits(ghost_index as u32, ghost_index_bits)?;

        if record.flags.kill_ghost {
            stream.write_bool(true)?; // destroy bit
            return Ok(PackOutcome::Destroyed);
        }
        stream.write_bool(false)?;

        let object = match record.object.upgrade() {
            Some(obj) => obj,
            None => return Ok(PackOutcome::Gone),
        };
        let borrowed = object.borrow();

        if record.flags.not_yet_ghosted {
            stream.write_bits(borrowed.type_handle().0 as u32, 16)?;
            reflect::write_object(stream, borrowed.type_handle(), borrowed.as_any(), u32::MAX, true)?;
            Ok(PackOutcome::Wrote(u32::MAX))
        } else {
            let mask = record.dirty_mask;
            stream.write_bits(mask, 32)?;
            let residual = reflect::write_object(stream, borrowed.type_handle(), borrowed.as_any(), mask, false)?;
            Ok(PackOutcome::Wrote(mask & !residual))
        }
    }

    fn after_write(&mut self, ghost_index: u16, write_mask: u32) {
        let array_index = self.slots[ghost_index as usize].as_ref().unwrap().array_index;
        let was_create = self.slots[ghost_index as usize].as_ref().unwrap().flags.not_yet_ghosted;
        let was_destroy = self.slots[ghost_index as usize].as_ref().unwrap().flags.kill_ghost;

        {
            let record = self.slots[ghost_index as usize].as_mut().unwrap();
            record.chain.push_back(ChainEntry {
                write_mask,
                is_create: was_create,
                is_destroy: was_destroy,
            });

            if was_destroy {
                record.flags.kill_ghost = false;
                record.flags.killing_ghost = true;
                record.dirty_mask = 0;
            } else if was_create {
                record.flags.not_yet_ghosted = false;
                record.flags.ghosting = true;
                record.dirty_mask = 0;
            } else {
                record.dirty_mask &= !write_mask;
            }
        }

        if was_destroy {
            self.demote_dirty_to_idle(array_index);
        } else if self.slots[ghost_index as usize].as_ref().unwrap().dirty_mask == 0 {
            self.demote_dirty_to_idle(array_index);
        }
    }

    /// Read phase: decode an incoming ghost section and apply it to the
    /// mirror table.
    pub fn unpack(&mut self, stream: &mut BitReader, connection: ConnectionId) -> NetResult<()> {
        let present = stream.read_bool()?;
        if !present {
            return Ok(());
        }

        let ghost_index_bits = stream.read_bits(3)? + 3;

        loop {
            let has_more = stream.read_bool()?;
            if !has_more {
                break;
            }

            let ghost_index = stream.read_bits(ghost_index_bits)? as u16;
            if ghost_index as usize >= self.max_ghosts {
                return Err(NetError::Fatal(ErrorType::GhostIndexOutOfRange));
            }

            let is_destroy = stream.read_bool()?;
            if is_destroy {
                if let Some(mut mirror) = self.remote[ghost_index as usize].take() {
                    mirror.object.on_ghost_remove(connection);
                }
                continue;
            }

            if self.remote[ghost_index as usize].is_none() {
                let type_handle = TypeHandle(stream.read_bits(16)? as u16);
                let mut object = reflect::construct_ghost(type_handle)?;
                reflect::read_object(stream, type_handle, object.as_any_mut(), u32::MAX, true)?;
                if !object.on_ghost_add(connection) {
                    return Err(NetError::Fatal(ErrorType::GhostAddFailed));
                }
                self.remote[ghost_index as usize] = Some(RemoteGhost { type_handle, object });
            } else {
                let mask = stream.read_bits(32)?;
                let mirror = self.remote[ghost_index as usize].as_mut().unwrap();
                reflect::read_object(stream, mirror.type_handle, mirror.object.as_any_mut(), mask, false)?;
                mirror.object.on_ghost_update(connection, mask);
            }
        }

        Ok(())
    }

    /// Drops every mirror and source record, as `disconnect` requires.
    pub fn clear(&mut self, connection: ConnectionId) {
        for slot in self.remote.iter_mut() {
            if let Some(mut mirror) = slot.take() {
                mirror.object.on_ghost_remove(connection);
            }
        }
        self.reset_ghosting();
    }
}

impl GhostNotifyHandler<GhostRef> for GhostManager {
    fn packet_delivered(&mut self, ghosts: Vec<GhostRef>) {
        for ghost_ref in ghosts {
            let ghost_index = ghost_ref.ghost_index;
            let entry = match self.slots[ghost_index as usize].as_mut().and_then(|r| r.chain.pop_front()) {
                Some(entry) => entry,
                None => continue,
            };

            if entry.is_destroy {
                let array_index = self.slots[ghost_index as usize].as_ref().unwrap().array_index;
                self.demote_to_free(array_index);
                let object_id = self.slots[ghost_index as usize].as_ref().unwrap().object_id;
                self.by_object.remove(&object_id);
                self.slots[ghost_index as usize] = None;
            } else if entry.is_create {
                let record = self.slots[ghost_index as usize].as_mut().unwrap();
                record.flags.ghosting = false;
                if let Some(obj) = record.object.upgrade() {
                    obj.borrow_mut().on_ghost_available(ConnectionId(0));
                }
            }
        }
    }

    fn packet_lost(&mut self, ghosts: Vec<GhostRef>) {
        for ghost_ref in ghosts {
            let ghost_index = ghost_ref.ghost_index;
            let record = match self.slots[ghost_index as usize].as_mut() {
                Some(r) => r,
                None => continue,
            };
            let entry = match record.chain.pop_front() {
                Some(entry) => entry,
                None => continue,
            };

            let resent_bits = record.chain.iter().fold(0u32, |acc, c| acc | c.write_mask);
            let residual = entry.write_mask & !resent_bits;
            let was_idle = record.dirty_mask == 0;

            if entry.is_destroy {
                record.flags.killing_ghost = false;
                record.flags.kill_ghost = true;
                record.dirty_mask = u32::MAX;
            } else if entry.is_create {
                record.flags.ghosting = false;
                record.flags.not_yet_ghosted = true;
                record.dirty_mask |= residual;
            } else {
                record.dirty_mask |= residual;
            }

            if was_idle && record.dirty_mask != 0 {
                let array_index = record.array_index;
                self.promote_idle_to_dirty(array_index);
            }
        }
    }
}
