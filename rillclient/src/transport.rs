//! `Socket` counterpart to `rillserver::transport`, client side: exactly
//! one peer, so there is no address-to-id table at all - `ConnectionId` is
//! always whatever the single `Interface::connect` call handed back,
//! which is `ConnectionId(0)` on a freshly constructed `Interface`.

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

pub struct UdpClientTransport {
    socket: UdpSocket,
    server: Option<SocketAddr>,
    next_sequence: u16,
    recv_buf: Vec<u8>,
}

impl UdpClientTransport {
    pub fn new() -> io::Result<UdpClientTransport> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        Ok(UdpClientTransport { socket, server: None, next_sequence: 0, recv_buf: vec![0u8; 2048] })
    }

    fn send_tagged(&self, tag: u8, payload: &[u8]) -> NetResult<()> {
        let address = self.server.ok_or(NetError::Fatal(ErrorType::ProtocolError))?;
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(tag);
        datagram.extend_from_slice(payload);
        self.socket.send_to(&datagram, address)?;
        Ok(())
    }
}

impl Socket for UdpClientTransport {
    fn send_to(&mut self, address: SocketAddr, bytes: &[u8]) -> NetResult<()> {
        self.socket.send_to(bytes, address)?;
        Ok(())
    }

    fn connect(&mut self, address: SocketAddr, data: &[u8]) -> NetResult<()> {
        self.server = Some(address);
        self.send_tagged(TAG_HELLO, data)
    }

    fn accept_connection(&mut self, _id: ConnectionId) -> NetResult<()> {
        Err(NetError::Fatal(ErrorType::ProtocolError))
    }

    fn close_connection(&mut self, _id: ConnectionId, reason: &[u8]) -> NetResult<()> {
        self.send_tagged(TAG_DISCONNECT, reason)
    }

    fn send_to_connection(&mut self, _id: ConnectionId, bytes: &[u8]) -> NetResult<()> {
        self.send_tagged(TAG_DATA, bytes)
    }

    fn poll(&mut self) -> Vec<SocketEvent> {
        let mut events = Vec::new();
        loop {
            let (len, source) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(result) => result,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            };
            if self.server != Some(source) || len == 0 {
                continue;
            }
            let tag = self.recv_buf[0];
            let payload = self.recv_buf[1..len].to_vec();

            match tag {
                TAG_CHALLENGE => {
                    let _ = self.send_tagged(TAG_CHALLENGE_RESPONSE, &[]);
                    events.push(SocketEvent::ConnectionChallengeResponse { connection: ConnectionId(0), key: Vec::new(), payload });
                }
                TAG_ACCEPT => {
                    events.push(SocketEvent::ConnectionEstablished { connection: ConnectionId(0) });
                }
                TAG_DISCONNECT => {
                    events.push(SocketEvent::ConnectionDisconnected { connection: ConnectionId(0), reason: payload });
                }
                TAG_DATA => {
                    let sequence = self.next_sequence;
                    self.next_sequence = self.next_sequence.wrapping_add(1);
                    events.push(SocketEvent::ConnectionPacket { connection: ConnectionId(0), sequence, bytes: payload });
                }
                TAG_HELLO => {}
                _ => events.push(SocketEvent::SocketPacket { source, bytes: payload }),
            }
        }
        events
    }
}
