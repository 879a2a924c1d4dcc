//! A real `Socket` backed by `std::net::UdpSocket`, server side: many
//! peers share one local port, each bound to a `ConnectionId` once its
//! handshake starts.
//!
//! The five `Socket` primitives say nothing about *how* a peer earns a
//! `ConnectionId` or how a datagram gets routed to one - that plumbing is
//! every transport's own business. This one keeps it to a one-byte tag in
//! front of every datagram and an accept-all three-way handshake (hello /
//! challenge / challenge-response / accept); there is no cryptographic
//! challenge content, just enough round trips to drive `Connection`'s
//! state machine for real traffic.

use hashbrown::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};

use rillcore::error::{ErrorType, NetError, NetResult};
use rillcore::object::ConnectionId;
use rillcore::socket::{Socket, SocketEvent};

const TAG_HELLO: u8 = 0;
const TAG_CHALLENGE: u8 = 1;
const TAG_CHALLENGE_RESPONSE: u8 = 2;
const TAG_ACCEPT: u8 = 3;
const TAG_DISCONNECT: u8 = 4;
const TAG_DATA: u8 = 5;

pub struct UdpServerTransport {
    socket: UdpSocket,
    bindings: HashMap<ConnectionId, SocketAddr>,
    by_address: HashMap<SocketAddr, ConnectionId>,
    next_id: u32,
    next_sequence: u16,
    recv_buf: Vec<u8>,
}

impl UdpServerTransport {
    pub fn bind(address: &str) -> io::Result<UdpServerTransport> {
        let socket = UdpSocket::bind(address)?;
        socket.set_nonblocking(true)?;
        Ok(UdpServerTransport {
            socket,
            bindings: HashMap::new(),
            by_address: HashMap::new(),
            next_id: 0,
            next_sequence: 0,
            recv_buf: vec![0u8; 2048],
        })
    }

    fn send_tagged(&self, address: SocketAddr, tag: u8, payload: &[u8]) -> NetResult<()> {
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(tag);
        datagram.extend_from_slice(payload);
        self.socket.send_to(&datagram, address)?;
        Ok(())
    }

    fn address_of(&self, id: ConnectionId) -> NetResult<SocketAddr> {
        self.bindings.get(&id).copied().ok_or(NetError::Fatal(ErrorType::ProtocolError))
    }
}

impl Socket for UdpServerTransport {
    fn send_to(&mut self, address: SocketAddr, bytes: &[u8]) -> NetResult<()> {
        self.socket.send_to(bytes, address)?;
        Ok(())
    }

    fn connect(&mut self, _address: SocketAddr, _data: &[u8]) -> NetResult<()> {
        // A server never initiates; only a client calls this.
        Err(NetError::Fatal(ErrorType::ProtocolError))
    }

    fn accept_connection(&mut self, id: ConnectionId) -> NetResult<()> {
        let address = self.address_of(id)?;
        self.send_tagged(address, TAG_CHALLENGE, &[])
    }

    fn close_connection(&mut self, id: ConnectionId, reason: &[u8]) -> NetResult<()> {
        let address = self.address_of(id)?;
        let result = self.send_tagged(address, TAG_DISCONNECT, reason);
        self.by_address.remove(&address);
        self.bindings.remove(&id);
        result
    }

    fn send_to_connection(&mut self, id: ConnectionId, bytes: &[u8]) -> NetResult<()> {
        let address = self.address_of(id)?;
        self.send_tagged(address, TAG_DATA, bytes)
    }

    fn poll(&mut self) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        loop {
            let (len, source) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(result) => result,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };
            if len == 0 {
                continue;
            }
            let tag = self.recv_buf[0];
            let payload = self.recv_buf[1..len].to_vec();

            match tag {
                TAG_HELLO => {
                    if !self.by_address.contains_key(&source) {
                        let id = ConnectionId(self.next_id);
                        self.next_id += 1;
                        self.by_address.insert(source, id);
                        self.bindings.insert(id, source);
                        events.push(SocketEvent::ConnectionRequested { connection: id, key: Vec::new(), payload });
                    }
                }
                TAG_CHALLENGE_RESPONSE => {
                    if let Some(&id) = self.by_address.get(&source) {
                        events.push(SocketEvent::ConnectionChallengeResponse { connection: id, key: Vec::new(), payload });
                        events.push(SocketEvent::ConnectionEstablished { connection: id });
                        let _ = self.send_tagged(source, TAG_ACCEPT, &[]);
                    }
                }
                TAG_DISCONNECT => {
                    if let Some(id) = self.by_address.remove(&source) {
                        self.bindings.remove(&id);
                        events.push(SocketEvent::ConnectionDisconnected { connection: id, reason: payload });
                    }
                }
                TAG_DATA => {
                    if let Some(&id) = self.by_address.get(&source) {
                        let sequence = self.next_sequence;
                        self.next_sequence = self.next_sequence.wrapping_add(1);
                        events.push(SocketEvent::ConnectionPacket { connection: id, sequence, bytes: payload });
                    }
                }
                _ => events.push(SocketEvent::SocketPacket { source, bytes: payload }),
            }
        }
        events
    }
}
