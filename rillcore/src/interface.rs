//! Owns every live `Connection` and the one `Socket` collaborator they all
//! share: a free-list/live-set slot pool keyed by a small integer id, a
//! drained `changes()` queue the caller pulls connect/disconnect
//! notifications from, and a fold of `NetError::Wait` vs `Fatal` while
//! driving each connection.

use std::collections::HashMap;
use std::any::Any;
use std::net::SocketAddr;
use std::time::Instant;

use indexmap::IndexSet;

use crate::config::Config;
use crate::connection::Connection;
use crate::error::{ErrorUtils, NetError, NetResult};
use crate::logging;
use crate::object::{ConnectionId, ScopeSource};
use crate::reflect::TypeHandle;
use crate::socket::{Socket, SocketEvent};

/// A connectivity change the caller should react to (spawn a player, tear
/// down a session, ...), the way `Endpoint::changes()` surfaces connects
/// and disconnects to its caller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ConnectionChange {
    Established(ConnectionId),
    Disconnected(ConnectionId),
    TimedOut(ConnectionId),
}

/// Demultiplexes `SocketEvent`s to the matching `Connection`, drives every
/// established connection's tick and timeout housekeeping, and hands
/// outgoing datagrams back to the socket. One `Interface` per local
/// endpoint (a server's listen socket, or a client's single outbound
/// connection).
pub struct Interface<S: Socket> {
    socket: S,
    config: Config,
    connections: Vec<Option<Connection>>,
    free: Vec<u32>,
    /// Every currently-occupied slot, in insertion order - lets `poll` walk
    /// just the live connections instead of the whole slot vector including
    /// freed holes.
    live: IndexSet<ConnectionId>,
    pending_by_address: HashMap<SocketAddr, ConnectionId>,
    changes: Vec<ConnectionChange>,
    log: logging::Logger,
}

impl<S: Socket> Interface<S> {
    pub fn new(socket: S, config: Config, log: logging::Logger) -> Interface<S> {
        Interface {
            socket,
            config,
            connections: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            pending_by_address: HashMap::new(),
            changes: Vec::new(),
            log,
        }
    }

    #[inline]
    pub fn socket(&self) -> &S {
        &self.socket
    }

    #[inline]
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id.0 as usize).and_then(|slot| slot.as_mut())
    }

    /// Drains all connectivity changes accumulated since the last call.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = ConnectionChange> + '_ {
        self.changes.drain(..)
    }

    fn allocate_slot(&mut self) -> u32 {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.connections.push(None);
                (self.connections.len() - 1) as u32
            }
        };
        self.live.insert(ConnectionId(index));
        index
    }

    fn free_connection(&mut self, id: ConnectionId) {
        self.connections[id.0 as usize] = None;
        self.free.push(id.0);
        self.live.remove(&id);
        self.pending_by_address.retain(|_, &mut bound| bound != id);
    }

    /// Starts an outbound connection attempt: allocates a pending
    /// connection slot and forwards the connect request to the socket
    /// collaborator, which owns the actual challenge/accept handshake.
    pub fn connect(&mut self, address: SocketAddr, data: &[u8], now: Instant) -> NetResult<ConnectionId> {
        self.socket.connect(address, data)?;
        let index = self.allocate_slot();
        let id = ConnectionId(index);
        let connection = Connection::new(id, &self.config, true, false, now, self.log.clone());
        self.connections[index as usize] = Some(connection);
        self.pending_by_address.insert(address, id);
        logging::debug!(self.log, "outbound connection attempt started";
            "context" => "connect", "connection_id" => id.0, "address" => %address);
        Ok(id)
    }

    pub fn accept(&mut self, id: ConnectionId) -> NetResult<()> {
        self.socket.accept_connection(id)
    }

    pub fn close(&mut self, id: ConnectionId, reason: &[u8]) -> NetResult<()> {
        if let Some(connection) = self.connection_mut(id) {
            connection.disconnect();
        }
        let result = self.socket.close_connection(id, reason);
        self.free_connection(id);
        self.changes.push(ConnectionChange::Disconnected(id));
        result
    }

    /// Drains the socket's event queue, dispatches each event to the
    /// connection it names (allocating a pending one for an unrecognized
    /// address), drives every established connection's `tick`, and runs
    /// the timeout sweep. `dispatch` receives the id of the connection an
    /// event arrived on along with the decoded event itself.
    pub fn poll(
        &mut self,
        now: Instant,
        scope: &mut dyn ScopeSource,
        dispatch: &mut dyn FnMut(ConnectionId, TypeHandle, Box<dyn Any>) -> NetResult<()>,
    ) {
        let events = self.socket.poll();
        for event in events {
            self.handle_event(event, now, dispatch);
        }

        let live: Vec<ConnectionId> = self.live.iter().copied().collect();
        for id in live {
            self.drive_connection(id, now, scope);
        }
    }

    fn handle_event(
        &mut self,
        event: SocketEvent,
        now: Instant,
        dispatch: &mut dyn FnMut(ConnectionId, TypeHandle, Box<dyn Any>) -> NetResult<()>,
    ) {
        match event {
            SocketEvent::SocketPacket { source, bytes } => {
                let _ = bytes; // handshake payload is the socket collaborator's concern
                if !self.pending_by_address.contains_key(&source) {
                    let index = self.allocate_slot();
                    let id = ConnectionId(index);
                    let connection = Connection::new(id, &self.config, false, true, now, self.log.clone());
                    self.connections[index as usize] = Some(connection);
                    self.pending_by_address.insert(source, id);
                    logging::debug!(self.log, "allocated pending connection for unrecognized address";
                        "context" => "handle_event", "connection_id" => id.0, "address" => %source);
                }
            }
            SocketEvent::ConnectionChallengeResponse { connection, .. } => {
                if let Some(conn) = self.connection_mut(connection) {
                    let _ = conn.on_challenge_response();
                }
            }
            SocketEvent::ConnectionRequested { connection, .. } => {
                // Accept-all policy: a deployment that needs admission
                // control (ban lists, capacity limits, ...) would gate this
                // on something other than "a packet arrived", but nothing
                // in spec section 6 hands the interface grounds to refuse
                // on its own, so every request is accepted.
                if let Err(err) = self.socket.accept_connection(connection) {
                    logging::debug!(self.log, "accept_connection failed";
                        "context" => "handle_event", "connection_id" => connection.0, "error" => ?err);
                }
            }
            SocketEvent::ConnectionEstablished { connection } => {
                let established = self.connection_mut(connection).map(|conn| conn.establish(now).is_ok()).unwrap_or(false);
                if established {
                    self.changes.push(ConnectionChange::Established(connection));
                }
            }
            SocketEvent::ConnectionDisconnected { connection, .. } => {
                if let Some(conn) = self.connection_mut(connection) {
                    conn.disconnect();
                }
                self.free_connection(connection);
                self.changes.push(ConnectionChange::Disconnected(connection));
            }
            SocketEvent::ConnectionPacket { connection, bytes, .. } => {
                self.receive_into(connection, now, &bytes, dispatch);
            }
            SocketEvent::ConnectionPacketNotify { connection, sequence, delivered } => {
                // Informational only - see the note on this variant in
                // socket.rs. The core derives delivery/loss from the
                // header embedded in every ConnectionPacket already.
                logging::trace!(self.log, "socket-level packet notify (not fed to Notify)";
                    "context" => "handle_event", "connection_id" => connection.0,
                    "sequence" => sequence, "delivered" => delivered);
            }
        }
    }

    fn receive_into(
        &mut self,
        id: ConnectionId,
        now: Instant,
        bytes: &[u8],
        dispatch: &mut dyn FnMut(ConnectionId, TypeHandle, Box<dyn Any>) -> NetResult<()>,
    ) {
        let result = match self.connection_mut(id) {
            Some(connection) => connection.receive_packet(now, bytes, &mut |handle, payload| dispatch(id, handle, payload)),
            None => return,
        };
        if result.has_failed() {
            if let Err(NetError::Fatal(reason)) = result {
                logging::debug!(self.log, "connection dropped on protocol error";
                    "context" => "receive_into", "connection_id" => id.0, "reason" => %reason);
            }
            if let Some(connection) = self.connection_mut(id) {
                connection.disconnect();
            }
            self.free_connection(id);
            self.changes.push(ConnectionChange::Disconnected(id));
        }
    }

    fn drive_connection(&mut self, id: ConnectionId, now: Instant, scope: &mut dyn ScopeSource) {
        let timed_out = match self.connection_mut(id) {
            Some(connection) => connection.check_timeout(now, self.config.connection_timeout()),
            None => return,
        };
        if timed_out {
            self.free_connection(id);
            self.changes.push(ConnectionChange::TimedOut(id));
            return;
        }

        let datagram = match self.connection_mut(id) {
            Some(connection) => connection.tick(now, scope),
            None => return,
        };

        if datagram.has_failed() {
            if let Err(NetError::Fatal(reason)) = datagram {
                logging::debug!(self.log, "connection dropped while ticking";
                    "context" => "drive_connection", "connection_id" => id.0, "reason" => %reason);
            }
            if let Some(connection) = self.connection_mut(id) {
                connection.disconnect();
            }
            self.free_connection(id);
            self.changes.push(ConnectionChange::Disconnected(id));
            return;
        }

        if let Ok(Some(bytes)) = datagram {
            if let Err(err) = self.socket.send_to_connection(id, &bytes) {
                logging::trace!(self.log, "send_to_connection did not accept the datagram";
                    "context" => "drive_connection", "connection_id" => id.0, "error" => ?err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::mock::MockSocket;

    struct NoScope;
    impl ScopeSource for NoScope {
        fn perform_scope_query(&mut self, _connection: ConnectionId, _query: &mut dyn crate::object::ScopeQuery) {}
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[test]
    fn connect_allocates_a_pending_connection() {
        let mut interface = Interface::new(MockSocket::new(), Config::default(), logging::discard());
        let id = interface.connect(addr(), &[], Instant::now()).unwrap();
        assert!(interface.connection(id).is_some());
        assert_eq!(interface.connection(id).unwrap().state(), crate::connection::ConnectionState::AwaitingChallenge);
    }

    #[test]
    fn established_event_promotes_state_and_emits_a_change() {
        let now = Instant::now();
        let mut interface = Interface::new(MockSocket::new(), Config::default(), logging::discard());
        let id = interface.connect(addr(), &[], now).unwrap();
        interface.connection_mut(id).unwrap().on_challenge_response().unwrap();

        interface.socket_mut().push_established(id);
        let mut scope = NoScope;
        interface.poll(now, &mut scope, &mut |_, _, _| Ok(()));

        assert!(interface.connection(id).unwrap().is_established());
        assert_eq!(interface.changes().collect::<Vec<_>>(), vec![ConnectionChange::Established(id)]);
    }

    #[test]
    fn disconnect_event_frees_the_slot_for_reuse() {
        let now = Instant::now();
        let mut interface = Interface::new(MockSocket::new(), Config::default(), logging::discard());
        let id = interface.connect(addr(), &[], now).unwrap();

        interface.close(id, b"bye").unwrap();
        assert!(interface.connection(id).is_none());

        let reused = interface.connect(addr(), &[], now).unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn timed_out_connection_is_freed_and_reported() {
        let now = Instant::now();
        let config = Config::default();
        let mut interface = Interface::new(MockSocket::new(), config.clone(), logging::discard());
        let id = interface.connect(addr(), &[], now).unwrap();
        interface.connection_mut(id).unwrap().on_challenge_response().unwrap();
        interface.socket_mut().push_established(id);
        let mut scope = NoScope;
        interface.poll(now, &mut scope, &mut |_, _, _| Ok(()));
        assert!(interface.changes().all(|c| matches!(c, ConnectionChange::Established(_))));

        let later = now + config.connection_timeout() + std::time::Duration::from_millis(1);
        interface.poll(later, &mut scope, &mut |_, _, _| Ok(()));

        assert!(interface.connection(id).is_none());
        assert_eq!(interface.changes().collect::<Vec<_>>(), vec![ConnectionChange::TimedOut(id)]);
    }
}
