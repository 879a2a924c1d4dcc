//! The abstraction boundary between the core and whatever actually owns a
//! UDP socket (spec section 6). The core never touches a socket directly;
//! it calls through this trait and drains `SocketEvent`s the collaborator
//! queues up - challenge/accept handshaking, raw packets and their fate,
//! is all the collaborator's problem, not the core's.

use std::net::SocketAddr;

use crate::error::NetResult;
use crate::object::ConnectionId;

/// One event the socket collaborator has queued for the core to consume.
/// `ConnectionPacketNotify` is surfaced for a collaborator that tracks its
/// own transport-level delivery (e.g. a congestion-aware send queue below
/// the reliable window); the core's own notify protocol (component B)
/// already derives delivery/loss from the header embedded in every
/// `ConnectionPacket`'s payload, so `Interface` only logs this one rather
/// than feeding it back into a connection's `Notify`.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    SocketPacket { source: SocketAddr, bytes: Vec<u8> },
    ConnectionChallengeResponse { connection: ConnectionId, key: Vec<u8>, payload: Vec<u8> },
    ConnectionRequested { connection: ConnectionId, key: Vec<u8>, payload: Vec<u8> },
    ConnectionEstablished { connection: ConnectionId },
    ConnectionDisconnected { connection: ConnectionId, reason: Vec<u8> },
    ConnectionPacket { connection: ConnectionId, sequence: u16, bytes: Vec<u8> },
    ConnectionPacketNotify { connection: ConnectionId, sequence: u16, delivered: bool },
}

/// What the core is allowed to ask the socket collaborator to do. Exactly
/// the five primitives spec section 6 allows; no byte-stream abstraction,
/// no raw `send`/`recv` leaks through.
pub trait Socket {
    fn send_to(&mut self, address: SocketAddr, bytes: &[u8]) -> NetResult<()>;
    fn connect(&mut self, address: SocketAddr, data: &[u8]) -> NetResult<()>;
    fn accept_connection(&mut self, id: ConnectionId) -> NetResult<()>;
    fn close_connection(&mut self, id: ConnectionId, reason: &[u8]) -> NetResult<()>;
    fn send_to_connection(&mut self, id: ConnectionId, bytes: &[u8]) -> NetResult<()>;

    /// Drains whatever events have accumulated since the last poll.
    fn poll(&mut self) -> Vec<SocketEvent>;
}

#[cfg(any(test, feature = "testing"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// An in-process `Socket` that loops packets sent to a connection id
    /// straight back out as `ConnectionPacket` events for a paired
    /// `MockSocket`, with no real network involved. Grounded on the
    /// teacher's `MockChannel` test harness (`buffer.rs`): a scriptable
    /// in-memory channel rather than a real transport, plus the ability to
    /// drop specific sends to script loss scenarios.
    pub struct MockSocket {
        inbox: VecDeque<SocketEvent>,
        /// Sequence stamped on outgoing `send_to_connection` calls, purely
        /// for the `ConnectionPacketNotify` bookkeeping a real transport
        /// would also track.
        next_sequence: u16,
        /// When set, the next `send_to_connection` is swallowed instead of
        /// delivered - used to script the packet-loss end-to-end scenario.
        drop_next_send: bool,
        /// Every payload handed to `send_to_connection` that wasn't
        /// dropped, for a test to relay into the peer's `deliver`.
        sent: VecDeque<(ConnectionId, Vec<u8>)>,
    }

    impl MockSocket {
        pub fn new() -> MockSocket {
            MockSocket { inbox: VecDeque::new(), next_sequence: 0, drop_next_send: false, sent: VecDeque::new() }
        }

        /// Drains the datagrams this socket was asked to send since the
        /// last call.
        pub fn take_sent(&mut self) -> Vec<(ConnectionId, Vec<u8>)> {
            self.sent.drain(..).collect()
        }

        /// Delivers `bytes` to this socket as if it arrived over the wire
        /// for `connection`.
        pub fn deliver(&mut self, connection: ConnectionId, bytes: Vec<u8>) {
            let sequence = self.next_sequence;
            self.next_sequence = self.next_sequence.wrapping_add(1);
            self.inbox.push_back(SocketEvent::ConnectionPacket { connection, sequence, bytes });
        }

        pub fn push_established(&mut self, connection: ConnectionId) {
            self.inbox.push_back(SocketEvent::ConnectionEstablished { connection });
        }

        /// Delivers a raw, not-yet-bound-to-any-connection datagram, as if
        /// it arrived from an address this side has never seen before.
        pub fn push_packet(&mut self, source: SocketAddr, bytes: Vec<u8>) {
            self.inbox.push_back(SocketEvent::SocketPacket { source, bytes });
        }

        /// Scripts the next `send_to_connection` call to silently drop its
        /// payload, as if the datagram never arrived.
        pub fn drop_next(&mut self) {
            self.drop_next_send = true;
        }
    }

    impl Socket for MockSocket {
        fn send_to(&mut self, _address: SocketAddr, _bytes: &[u8]) -> NetResult<()> {
            Ok(())
        }

        fn connect(&mut self, _address: SocketAddr, _data: &[u8]) -> NetResult<()> {
            Ok(())
        }

        fn accept_connection(&mut self, _id: ConnectionId) -> NetResult<()> {
            Ok(())
        }

        fn close_connection(&mut self, _id: ConnectionId, _reason: &[u8]) -> NetResult<()> {
            Ok(())
        }

        fn send_to_connection(&mut self, id: ConnectionId, bytes: &[u8]) -> NetResult<()> {
            if self.drop_next_send {
                self.drop_next_send = false;
                return Ok(());
            }
            self.sent.push_back((id, bytes.to_vec()));
            Ok(())
        }

        fn poll(&mut self) -> Vec<SocketEvent> {
            self.inbox.drain(..).collect()
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn drained_events_come_out_in_arrival_order() {
            let mut socket = MockSocket::new();
            socket.deliver(ConnectionId(1), vec![1]);
            socket.deliver(ConnectionId(1), vec![2]);

            let events = socket.poll();
            assert_eq!(events.len(), 2);
            match (&events[0], &events[1]) {
                (SocketEvent::ConnectionPacket { bytes: a, .. }, SocketEvent::ConnectionPacket { bytes: b, .. }) => {
                    assert_eq!(a, &vec![1]);
                    assert_eq!(b, &vec![2]);
                }
                _ => panic!("unexpected event shape"),
            }
            assert!(socket.poll().is_empty());
        }
    }
}
