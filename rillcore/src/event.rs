//! Event channel (component C): three outgoing FIFO queues keyed by
//! delivery discipline, RPC registration and dispatch.

use crate::bitstream::{BitReader, BitWriter};
use crate::error::{ErrorType, NetError, NetResult};
use crate::notify::{EventNotifyHandler, Fate};
use crate::reflect::{self, TypeHandle};
use hashbrown::HashMap;
use std::any::Any;
use std::collections::VecDeque;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Discipline {
    Unguaranteed,
    Guaranteed,
    GuaranteedOrdered,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
    Bidirectional,
}

/// A queued or in-flight event: its type, discipline, the already-boxed
/// payload, and - for guaranteed-ordered events only - the monotonic
/// sequence the receiver reorders on.
struct EventRecord {
    type_handle: TypeHandle,
    discipline: Discipline,
    payload: Box<dyn Any>,
    order_sequence: Option<u32>,
}

/// What a notify entry remembers about one packed event: enough to
/// re-queue it at the head of its queue on loss. The payload itself stays
/// in `in_flight` until delivery or loss resolves it, so this is a cheap
/// handle, not a copy of the event.
pub struct EventRef {
    discipline: Discipline,
    order_sequence: Option<u32>,
    slot: u64,
}

/// Registers how a remote method call is encoded and who may invoke it.
struct RpcBinding {
    direction: Direction,
    discipline: Discipline,
}

/// Per-connection event channel state.
pub struct EventChannel {
    unguaranteed: VecDeque<EventRecord>,
    guaranteed: VecDeque<EventRecord>,
    guaranteed_ordered: VecDeque<EventRecord>,

    next_order_sequence: u32,
    next_receive_sequence: u32,
    /// Guaranteed-ordered events whose sequence is ahead of
    /// `next_receive_sequence`, held until the gap closes.
    reorder_buffer: HashMap<u32, (TypeHandle, Box<dyn Any>)>,

    next_slot: u64,
    in_flight: HashMap<u64, EventRecord>,

    rpcs: HashMap<TypeHandle, RpcBinding>,
    is_server_side: bool,
}

pub type EventHandler = fn(&mut dyn Any, Box<dyn Any>) -> NetResult<()>;

impl EventChannel {
    pub fn new(is_server_side: bool) -> EventChannel {
        EventChannel {
            unguaranteed: VecDeque::new(),
            guaranteed: VecDeque::new(),
            guaranteed_ordered: VecDeque::new(),
            next_order_sequence: 0,
            next_receive_sequence: 0,
            reorder_buffer: HashMap::new(),
            next_slot: 0,
            in_flight: HashMap::new(),
            rpcs: HashMap::new(),
            is_server_side,
        }
    }

    /// Registers a remote-callable event type. `direction` restricts who
    /// may legally send it; a dispatch that violates it fails with
    /// `IllegalRpc` rather than silently running the handler.
    pub fn register_rpc(&mut self, handle: TypeHandle, direction: Direction, discipline: Discipline) {
        self.rpcs.insert(handle, RpcBinding { direction, discipline });
    }

    /// Appends to the correct outgoing queue. Never blocks: the queue has
    /// no bound other than memory.
    pub fn post_event(&mut self, type_handle: TypeHandle, discipline: Discipline, payload: Box<dyn Any>) -> NetResult<()> {
        if let Some(binding) = self.rpcs.get(&type_handle) {
            let allowed = match binding.direction {
                Direction::Bidirectional => true,
                Direction::ClientToServer => !self.is_server_side,
                Direction::ServerToClient => self.is_server_side,
            };
            if !allowed {
                return Err(NetError::Fatal(ErrorType::IllegalRpc));
            }
        }

        let order_sequence = if discipline == Discipline::GuaranteedOrdered {
            let seq = self.next_order_sequence;
            self.next_order_sequence = self.next_order_sequence.wrapping_add(1);
            Some(seq)
        } else {
            None
        };

        let record = EventRecord {
            type_handle,
            discipline,
            payload,
            order_sequence,
        };

        match discipline {
            Discipline::Unguaranteed => self.unguaranteed.push_back(record),
            Discipline::Guaranteed => self.guaranteed.push_back(record),
            Discipline::GuaranteedOrdered => self.guaranteed_ordered.push_back(record),
        }

        Ok(())
    }

    /// Packs as many queued events as fit into `stream`, starting with
    /// guaranteed-ordered (so sequence gaps close as fast as possible),
    /// then guaranteed, then unguaranteed. Partial events are never
    /// written: a field codec returning `Wait` rewinds the whole event.
    pub fn pack(&mut self, stream: &mut BitWriter) -> NetResult<Vec<EventRef>> {
        let count_mark = stream.mark();
        stream.write_bits(0, 16)?;

        let mut refs = Vec::new();
        self.pack_queue(Discipline::GuaranteedOrdered, stream, &mut refs)?;
        self.pack_queue(Discipline::Guaranteed, stream, &mut refs)?;
        self.pack_queue(Discipline::Unguaranteed, stream, &mut refs)?;

        stream.patch_bits(count_mark, refs.len() as u32, 16);
        Ok(refs)
    }

    fn queue_mut(&mut self, discipline: Discipline) -> &mut VecDeque<EventRecord> {
        match discipline {
            Discipline::Unguaranteed => &mut self.unguaranteed,
            Discipline::Guaranteed => &mut self.guaranteed,
            Discipline::GuaranteedOrdered => &mut self.guaranteed_ordered,
        }
    }

    fn pack_queue(&mut self, discipline: Discipline, stream: &mut BitWriter, refs: &mut Vec<EventRef>) -> NetResult<()> {
        loop {
            let record = match self.queue_mut(discipline).pop_front() {
                Some(record) => record,
                None => return Ok(()),
            };

            let mark = stream.mark();
            let written: NetResult<()> = (|| {
                stream.write_bits(record.type_handle.0 as u32, 16)?;
                if let Some(seq) = record.order_sequence {
                    stream.write_bits(seq, 32)?;
                }
                reflect::write_object(stream, record.type_handle, record.payload.as_ref(), u32::MAX, true)?;
                Ok(())
            })();

            match written {
                Ok(()) => {
                    let slot = self.next_slot;
                    self.next_slot = self.next_slot.wrapping_add(1);
                    refs.push(EventRef {
                        discipline,
                        order_sequence: record.order_sequence,
                        slot,
                    });
                    self.in_flight.insert(slot, record);
                }
                Err(NetError::Wait) => {
                    stream.rewind(mark);
                    self.queue_mut(discipline).push_front(record);
                    return Ok(());
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// Reads the event-count prefix, then for each event its type tag,
    /// resolves it through the type database, reads its fields and
    /// dispatches to `dispatch`.
    pub fn unpack_and_dispatch(&mut self, stream: &mut BitReader, dispatch: &mut dyn FnMut(TypeHandle, Box<dyn Any>) -> NetResult<()>) -> NetResult<()> {
        let count = stream.read_bits(16)?;
        for _ in 0..count {
            let handle = TypeHandle(stream.read_bits(16)? as u16);

            let binding = self.rpcs.get(&handle);
            let discipline = binding.map(|b| b.discipline).unwrap_or(Discipline::Unguaranteed);
            if let Some(binding) = binding {
                let allowed = match binding.direction {
                    Direction::Bidirectional => true,
                    Direction::ClientToServer => self.is_server_side,
                    Direction::ServerToClient => !self.is_server_side,
                };
                if !allowed {
                    return Err(NetError::Fatal(ErrorType::IllegalRpc));
                }
            }

            let order_sequence = if discipline == Discipline::GuaranteedOrdered {
                Some(stream.read_bits(32)?)
            } else {
                None
            };

            let mut instance = reflect::construct(handle)?;
            reflect::read_object(stream, handle, instance.as_mut(), u32::MAX, true)?;

            match order_sequence {
                None => dispatch(handle, instance)?,
                Some(seq) => {
                    if seq == self.next_receive_sequence {
                        dispatch(handle, instance)?;
                        self.next_receive_sequence = self.next_receive_sequence.wrapping_add(1);
                        // Draining any buffered events that are now in order.
                        while let Some((h, payload)) = self.reorder_buffer.remove(&self.next_receive_sequence) {
                            dispatch(h, payload)?;
                            self.next_receive_sequence = self.next_receive_sequence.wrapping_add(1);
                        }
                    } else {
                        self.reorder_buffer.insert(seq, (handle, instance));
                    }
                }
            }
        }
        Ok(())
    }
}

impl EventNotifyHandler<EventRef> for EventChannel {
    fn packet_delivered(&mut self, events: Vec<EventRef>) {
        for event_ref in events {
            self.in_flight.remove(&event_ref.slot);
        }
    }

    fn packet_lost(&mut self, events: Vec<EventRef>) {
        // Oldest-sequence-first so re-queueing at each head preserves the
        // original relative order once everything is back in its queue.
        let mut lost: Vec<EventRef> = events;
        lost.sort_by_key(|r| r.order_sequence.unwrap_or(0));

        for event_ref in lost.into_iter().rev() {
            let record = match self.in_flight.remove(&event_ref.slot) {
                Some(record) => record,
                None => continue,
            };
            match record.discipline {
                Discipline::Unguaranteed => {
                    // Discarded: an unguaranteed event is never resent.
                }
                Discipline::Guaranteed | Discipline::GuaranteedOrdered => {
                    self.queue_mut(record.discipline).push_front(record);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{FieldDescriptor, TypeDescriptor};

    #[derive(Debug, PartialEq)]
    struct Ping {
        value: i32,
    }

    fn write_value(obj: &dyn Any, s: &mut BitWriter) -> NetResult<()> {
        s.write_signed(obj.downcast_ref::<Ping>().unwrap().value, 16)
    }
    fn read_value(obj: &mut dyn Any, s: &mut BitReader) -> NetResult<()> {
        obj.downcast_mut::<Ping>().unwrap().value = s.read_signed(16)?;
        Ok(())
    }
    fn always_equal(_: &dyn Any, _: &dyn Any) -> bool {
        true
    }
    fn make_ping() -> Box<dyn Any> {
        Box::new(Ping { value: 0 })
    }

    fn register_ping(name: &'static str) -> TypeHandle {
        reflect::register_type(
            TypeDescriptor::new(
                name,
                None,
                vec![FieldDescriptor {
                    name: "value",
                    state_bit: 0,
                    initial: false,
                    write: write_value,
                    read: read_value,
                    compare: always_equal,
                }],
            )
            .with_factory(make_ping),
        )
        .unwrap()
    }

    #[test]
    fn post_and_pack_then_unpack_round_trips() {
        let handle = register_ping("event::tests::Ping");
        let mut channel = EventChannel::new(false);
        channel.post_event(handle, Discipline::Unguaranteed, Box::new(Ping { value: 42 })).unwrap();

        let mut writer = BitWriter::new(64);
        let refs = channel.pack(&mut writer).unwrap();
        assert_eq!(refs.len(), 1);

        let bytes = writer.bytes().to_vec();
        let mut reader = BitReader::new(&bytes);
        let mut received = Vec::new();
        let mut receiver = EventChannel::new(true);
        receiver
            .unpack_and_dispatch(&mut reader, &mut |_, payload| {
                received.push(*payload.downcast::<Ping>().unwrap());
                Ok(())
            })
            .unwrap();

        assert_eq!(received, vec![Ping { value: 42 }]);
    }

    #[test]
    fn unguaranteed_event_is_discarded_on_loss() {
        let handle = register_ping("event::tests::PingUnguaranteed");
        let mut channel = EventChannel::new(false);
        channel.post_event(handle, Discipline::Unguaranteed, Box::new(Ping { value: 1 })).unwrap();

        let mut writer = BitWriter::new(64);
        let refs = channel.pack(&mut writer).unwrap();
        channel.packet_lost(refs);

        assert_eq!(channel.unguaranteed.len(), 0);
    }

    #[test]
    fn guaranteed_event_requeues_at_head_on_loss() {
        let handle = register_ping("event::tests::PingGuaranteed");
        let mut channel = EventChannel::new(false);
        channel.post_event(handle, Discipline::Guaranteed, Box::new(Ping { value: 7 })).unwrap();
        channel.post_event(handle, Discipline::Guaranteed, Box::new(Ping { value: 8 })).unwrap();

        let mut writer = BitWriter::new(64);
        let refs = channel.pack(&mut writer).unwrap();
        assert_eq!(refs.len(), 2);

        channel.packet_lost(refs);
        assert_eq!(channel.guaranteed.len(), 2);
        assert_eq!(channel.guaranteed[0].payload.downcast_ref::<Ping>().unwrap().value, 7);
    }

    #[test]
    fn guaranteed_ordered_dispatch_holds_out_of_order_arrivals() {
        let handle = register_ping("event::tests::PingOrdered");
        let mut a = EventChannel::new(false);
        a.post_event(handle, Discipline::GuaranteedOrdered, Box::new(Ping { value: 1 })).unwrap();
        a.post_event(handle, Discipline::GuaranteedOrdered, Box::new(Ping { value: 2 })).unwrap();

        let mut writer = BitWriter::new(64);
        a.pack(&mut writer).unwrap();
        let bytes = writer.bytes().to_vec();
        let mut reader = BitReader::new(&bytes);

        let mut b = EventChannel::new(true);
        let mut received = Vec::new();
        b.unpack_and_dispatch(&mut reader, &mut |_, payload| {
            received.push(payload.downcast::<Ping>().unwrap().value);
            Ok(())
        })
        .unwrap();

        assert_eq!(received, vec![1, 2]);
    }

    #[test]
    fn illegal_rpc_direction_is_rejected() {
        let handle = register_ping("event::tests::PingServerOnly");
        let mut client = EventChannel::new(false);
        client.register_rpc(handle, Direction::ServerToClient, Discipline::Unguaranteed);

        let result = client.post_event(handle, Discipline::Unguaranteed, Box::new(Ping { value: 1 }));
        assert_eq!(result, Err(NetError::Fatal(ErrorType::IllegalRpc)));
    }
}
