//! Connection state machine and per-tick datagram assembly (component E).
//! One `Connection` owns everything needed to drive a single peer: the
//! notify window, the event channel and the ghost manager, all keyed by
//! the same `ConnectionId` the application sees in its hooks.

use crate::bitstream::{BitReader, BitWriter};
use crate::config::Config;
use crate::error::{ErrorType, NetError, NetResult};
use crate::event::{Direction, Discipline, EventChannel, EventRef};
use crate::ghost::{GhostManager, GhostRef};
use crate::logging;
use crate::notify::{self, Fate, Notify, NotifyHeader};
use crate::object::{ConnectionId, ObjectId, ScopeSource};
use crate::reflect::TypeHandle;
use std::any::Any;
use std::time::{Duration, Instant};

/// `awaiting_challenge -> awaiting_connect_response -> established ->
/// (disconnected | timed_out)`. Only `Established` permits event and ghost
/// traffic; the handshake states exist purely so the interface can reject
/// stray traffic before the peer has proven itself.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionState {
    AwaitingChallenge,
    AwaitingConnectResponse,
    Established,
    Disconnected,
    TimedOut,
}

pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,

    /// Set by whichever side initiates the connect; symmetric on the
    /// acceptor. Informational only - the wire format already self-gates
    /// ghost traffic on the sender's `GhostManager::is_ghosting`, so these
    /// flags exist for the application to assert its own intent against,
    /// not to police the packer.
    ghost_to: bool,
    ghost_from: bool,

    max_packet_size: usize,
    ghost_index_bits: u32,
    notify_window: usize,
    notify_timeout: Duration,

    notify: Notify<EventRef, GhostRef>,
    events: EventChannel,
    ghosts: GhostManager,

    log: logging::Logger,
}

impl Connection {
    pub fn new(id: ConnectionId, config: &Config, is_initiator: bool, is_server_side: bool, now: Instant, log: logging::Logger) -> Connection {
        let log = log.new(logging::o!("connection_id" => id.0));

        logging::debug!(log, "connection created";
            "context" => "new", "is_initiator" => is_initiator, "is_server_side" => is_server_side);

        Connection {
            id,
            state: ConnectionState::AwaitingChallenge,
            ghost_to: is_initiator,
            ghost_from: !is_initiator,
            max_packet_size: config.max_packet_size,
            ghost_index_bits: config.ghost_index_bits(),
            notify_window: config.notify_window,
            notify_timeout: config.notify_timeout(),
            notify: Notify::new(config.notify_window, config.notify_timeout(), now),
            events: EventChannel::new(is_server_side),
            ghosts: GhostManager::new(config.max_ghosts, config.min_padding_bits),
            log,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    #[inline]
    pub fn ghost_to(&self) -> bool {
        self.ghost_to
    }

    #[inline]
    pub fn ghost_from(&self) -> bool {
        self.ghost_from
    }

    /// The challenge round-trip completed; the peer is proven and the
    /// connection can move on to waiting for the final accept.
    pub fn on_challenge_response(&mut self) -> NetResult<()> {
        if self.state != ConnectionState::AwaitingChallenge {
            return Err(NetError::Fatal(ErrorType::ProtocolError));
        }
        self.state = ConnectionState::AwaitingConnectResponse;
        logging::debug!(self.log, "challenge response received"; "context" => "on_challenge_response");
        Ok(())
    }

    /// Promotes the connection to `Established`, after which `tick` and
    /// `receive_packet` start doing real work.
    pub fn establish(&mut self, now: Instant) -> NetResult<()> {
        if self.state != ConnectionState::AwaitingConnectResponse {
            return Err(NetError::Fatal(ErrorType::ProtocolError));
        }
        self.state = ConnectionState::Established;
        self.notify = Notify::new(self.notify_window, self.notify_timeout, now);
        logging::debug!(self.log, "connection established"; "context" => "establish");
        Ok(())
    }

    pub fn register_rpc(&mut self, handle: TypeHandle, direction: Direction, discipline: Discipline) {
        self.events.register_rpc(handle, direction, discipline);
    }

    pub fn post_event(&mut self, handle: TypeHandle, discipline: Discipline, payload: Box<dyn Any>) -> NetResult<()> {
        self.events.post_event(handle, discipline, payload)
    }

    /// Bumps this side's ghosting session and returns it; the caller is
    /// expected to hand the id to the peer as an activate-ghosting event.
    pub fn activate_ghosting(&mut self) -> u32 {
        self.ghosts.activate_ghosting()
    }

    /// Confirms a prior `activate_ghosting` once the peer echoes the
    /// session id back as ready; only then does `tick` start transmitting
    /// ghost content.
    pub fn confirm_ghosting(&mut self, session_id: u32) -> bool {
        self.ghosts.confirm_ghosting(session_id)
    }

    pub fn reset_ghosting(&mut self) {
        self.ghosts.reset_ghosting();
    }

    /// Forwards a dirtied object's bits into this connection's ghost
    /// record for it, if one exists. See `GhostManager::mark_dirty`.
    pub fn mark_dirty(&mut self, object_id: ObjectId, bits: u32) {
        self.ghosts.mark_dirty(object_id, bits);
    }

    /// Runs one tick: ages out stale notify entries, packs ghost updates
    /// then events into a fresh datagram, and stamps the notify header.
    /// Returns `None` outside `Established` - there is nothing to send.
    pub fn tick(&mut self, now: Instant, scope: &mut dyn ScopeSource) -> NetResult<Option<Vec<u8>>> {
        if self.state != ConnectionState::Established {
            return Ok(None);
        }

        let aged = self.notify.age_out(now);
        if !aged.is_empty() {
            logging::trace!(self.log, "aging out stale notify entries"; "context" => "tick", "count" => aged.len());
        }
        let resolved = aged.into_iter().map(|entry| (entry, Fate::Lost)).collect();
        notify::dispatch_fates(resolved, &mut self.events, &mut self.ghosts);

        let mut stream = BitWriter::new(self.max_packet_size);

        // Notify header is written last (its sequence depends on what gets
        // packed), so its three fields are reserved here and patched once
        // `send_packet` hands back a sequence number.
        let header_mark = stream.mark();
        stream.write_bits(0, 16)?;
        stream.write_bits(0, 16)?;
        stream.write_bits(0, 16)?;

        let ghost_refs = self.ghosts.pack(&mut stream, scope, self.id, self.ghost_index_bits)?;
        let event_refs = self.events.pack(&mut stream)?;
        stream.byte_align()?;

        let sequence = self.notify.send_packet(now, event_refs, ghost_refs);
        let header = self.notify.header_for_send(sequence);
        stream.patch_bits(header_mark, header.sequence as u32, 16);
        stream.patch_bits(header_mark + 16, header.ack_sequence as u32, 16);
        stream.patch_bits(header_mark + 32, header.ack_history as u32, 16);

        logging::trace!(self.log, "packed outgoing datagram";
            "context" => "tick", "sequence" => sequence, "bytes" => stream.bytes().len());

        Ok(Some(stream.bytes().to_vec()))
    }

    /// Decodes one incoming datagram: notify header, then ghosts, then
    /// events. `dispatch` is the application's RPC/event sink.
    pub fn receive_packet(&mut self, now: Instant, bytes: &[u8], dispatch: &mut dyn FnMut(TypeHandle, Box<dyn Any>) -> NetResult<()>) -> NetResult<()> {
        if self.state != ConnectionState::Established {
            return Err(NetError::Fatal(ErrorType::ProtocolError));
        }

        let mut reader = BitReader::new(bytes);
        let header = NotifyHeader {
            sequence: reader.read_bits(16)? as u16,
            ack_sequence: reader.read_bits(16)? as u16,
            ack_history: reader.read_bits(16)? as u16,
        };

        let resolved = self.notify.receive(now, header);
        notify::dispatch_fates(resolved, &mut self.events, &mut self.ghosts);

        self.ghosts.unpack(&mut reader, self.id)?;
        self.events.unpack_and_dispatch(&mut reader, dispatch)?;

        logging::trace!(self.log, "received datagram"; "context" => "receive_packet", "sequence" => header.sequence);

        Ok(())
    }

    /// Declares the connection timed out if no traffic arrived within
    /// `timeout` of the last received datagram. Detaches ghosts on this
    /// side's bookkeeping; no further callbacks fire once this returns
    /// `true`.
    pub fn check_timeout(&mut self, now: Instant, timeout: Duration) -> bool {
        if self.state == ConnectionState::Established && now.duration_since(self.notify.last_received_at()) >= timeout {
            logging::debug!(self.log, "connection timed out"; "context" => "check_timeout");
            self.ghosts.clear(self.id);
            self.state = ConnectionState::TimedOut;
            true
        } else {
            false
        }
    }

    /// Tears the connection down immediately: frees ghost state, drops
    /// queued events by letting them go out of scope. No further callbacks
    /// fire after this returns.
    pub fn disconnect(&mut self) {
        logging::debug!(self.log, "disconnecting"; "context" => "disconnect");
        self.ghosts.clear(self.id);
        self.state = ConnectionState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{self, FieldDescriptor, TypeDescriptor};

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

    fn register() -> TypeHandle {
        reflect::register_type(
            TypeDescriptor::new(
                "connection::tests::Ping",
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

    struct NoScope;
    impl ScopeSource for NoScope {
        fn perform_scope_query(&mut self, _connection: ConnectionId, _query: &mut dyn crate::object::ScopeQuery) {}
    }

    fn established_pair(config: &Config, now: Instant) -> (Connection, Connection) {
        let mut server = Connection::new(ConnectionId(1), config, true, true, now, logging::discard());
        let mut client = Connection::new(ConnectionId(2), config, false, false, now, logging::discard());
        server.on_challenge_response().unwrap();
        server.establish(now).unwrap();
        client.on_challenge_response().unwrap();
        client.establish(now).unwrap();
        (server, client)
    }

    #[test]
    fn event_posted_before_established_is_carried_across_tick() {
        let handle = register();
        let config = Config::default();
        let now = Instant::now();
        let (mut server, mut client) = established_pair(&config, now);

        server.post_event(handle, Discipline::Guaranteed, Box::new(Ping { value: 99 })).unwrap();

        let mut scope = NoScope;
        let datagram = server.tick(now, &mut scope).unwrap().unwrap();

        let mut received = Vec::new();
        client
            .receive_packet(now, &datagram, &mut |_, payload| {
                received.push(*payload.downcast::<Ping>().unwrap());
                Ok(())
            })
            .unwrap();

        assert_eq!(received, vec![Ping { value: 99 }]);
    }

    #[test]
    fn tick_before_established_produces_nothing() {
        let config = Config::default();
        let now = Instant::now();
        let mut server = Connection::new(ConnectionId(3), &config, true, true, now, logging::discard());
        let mut scope = NoScope;
        assert_eq!(server.tick(now, &mut scope).unwrap(), None);
    }

    #[test]
    fn no_traffic_past_timeout_marks_connection_timed_out() {
        let config = Config::default();
        let now = Instant::now();
        let (mut server, _client) = established_pair(&config, now);

        let later = now + config.connection_timeout() + Duration::from_millis(1);
        assert!(server.check_timeout(later, config.connection_timeout()));
        assert_eq!(server.state(), ConnectionState::TimedOut);
    }

    #[test]
    fn receive_packet_before_established_is_rejected() {
        let config = Config::default();
        let now = Instant::now();
        let mut client = Connection::new(ConnectionId(4), &config, false, false, now, logging::discard());
        let result = client.receive_packet(now, &[0u8; 6], &mut |_, _| Ok(()));
        assert_eq!(result, Err(NetError::Fatal(ErrorType::ProtocolError)));
    }
}
