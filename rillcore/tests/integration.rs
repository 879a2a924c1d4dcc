//! End-to-end scenarios driving either two `Interface<MockSocket>`s against
//! each other (handshake, ghost replication, scope-out, loss/restore) or two
//! bare `Connection`s (ordered-event reassembly, where no socket plumbing is
//! needed). Requires the `testing` feature, which exposes `socket::mock`
//! outside of `cfg(test)` - see `Cargo.toml`.

use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rillcore::config::Config;
use rillcore::connection::Connection;
use rillcore::event::{Direction, Discipline};
use rillcore::interface::{ConnectionChange, Interface};
use rillcore::lazy_static;
use rillcore::logging;
use rillcore::object::{ConnectionId, GhostHooks, ObjectId, ObjectRef, ReplicatedObject, ScopeQuery, ScopeSource};
use rillcore::reflect::{self, FieldDescriptor, TypeDescriptor, TypeHandle};
use rillcore::socket::mock::MockSocket;

// --- a minimal ghostable object, registered once and shared across tests --

struct DemoActor {
    id: ObjectId,
    x: i32,
    y: i32,
    dirty: u32,
}

fn write_x(obj: &dyn Any, s: &mut rillcore::bitstream::BitWriter) -> rillcore::error::NetResult<()> {
    s.write_signed(obj.downcast_ref::<DemoActor>().unwrap().x, 16)
}
fn read_x(obj: &mut dyn Any, s: &mut rillcore::bitstream::BitReader) -> rillcore::error::NetResult<()> {
    obj.downcast_mut::<DemoActor>().unwrap().x = s.read_signed(16)?;
    Ok(())
}
fn write_y(obj: &dyn Any, s: &mut rillcore::bitstream::BitWriter) -> rillcore::error::NetResult<()> {
    s.write_signed(obj.downcast_ref::<DemoActor>().unwrap().y, 16)
}
fn read_y(obj: &mut dyn Any, s: &mut rillcore::bitstream::BitReader) -> rillcore::error::NetResult<()> {
    obj.downcast_mut::<DemoActor>().unwrap().y = s.read_signed(16)?;
    Ok(())
}
fn always_equal(_: &dyn Any, _: &dyn Any) -> bool {
    true
}
fn make_demo_actor_ghost() -> Box<dyn GhostHooks> {
    Box::new(DemoActor { id: ObjectId(0), x: 0, y: 0, dirty: 0 })
}

lazy_static! {
    static ref DEMO_ACTOR_HANDLE: TypeHandle = reflect::register_type(
        TypeDescriptor::new(
            "integration::DemoActor",
            None,
            vec![
                FieldDescriptor { name: "x", state_bit: 0, initial: false, write: write_x, read: read_x, compare: always_equal },
                FieldDescriptor { name: "y", state_bit: 1, initial: false, write: write_y, read: read_y, compare: always_equal },
            ],
        )
        .with_ghost_factory(make_demo_actor_ghost),
    )
    .unwrap();
    /// Every `on_ghost_add`/`on_ghost_update` the mirror side ran, so a test
    /// can observe what the receiving side actually ended up with - the
    /// mirror table itself is private to `GhostManager`, these hooks are
    /// the only window into it.
    static ref MIRROR_LOG: Mutex<Vec<(u64, i32, i32)>> = Mutex::new(Vec::new());
    static ref REMOVED_LOG: Mutex<Vec<u64>> = Mutex::new(Vec::new());
}

fn latest_mirror(id: ObjectId) -> Option<(i32, i32)> {
    MIRROR_LOG.lock().unwrap().iter().rev().find(|(i, _, _)| *i == id.0).map(|(_, x, y)| (*x, *y))
}
fn was_removed(id: ObjectId) -> bool {
    REMOVED_LOG.lock().unwrap().contains(&id.0)
}

impl ReplicatedObject for DemoActor {
    fn type_handle(&self) -> TypeHandle {
        *DEMO_ACTOR_HANDLE
    }
    fn object_id(&self) -> ObjectId {
        self.id
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

impl GhostHooks for DemoActor {
    fn on_ghost_add(&mut self, _connection: ConnectionId) -> bool {
        MIRROR_LOG.lock().unwrap().push((self.id.0, self.x, self.y));
        true
    }
    fn on_ghost_update(&mut self, _connection: ConnectionId, _mask: u32) {
        MIRROR_LOG.lock().unwrap().push((self.id.0, self.x, self.y));
    }
    fn on_ghost_remove(&mut self, _connection: ConnectionId) {
        REMOVED_LOG.lock().unwrap().push(self.id.0);
    }
}

// --- scope sources -----------------------------------------------------

struct NoScope;
impl ScopeSource for NoScope {
    fn perform_scope_query(&mut self, _connection: ConnectionId, _query: &mut dyn ScopeQuery) {}
}

struct TestScope {
    objects: Vec<ObjectRef>,
}
impl ScopeSource for TestScope {
    fn perform_scope_query(&mut self, _connection: ConnectionId, query: &mut dyn ScopeQuery) {
        for object in &self.objects {
            query.object_in_scope(object);
        }
    }
}

// --- harness: two Interface<MockSocket>s standing in for server/client -

fn bring_up_pair(config: &Config) -> (Interface<MockSocket>, ConnectionId, Interface<MockSocket>, ConnectionId, Instant) {
    let now = Instant::now();
    let client_addr: SocketAddr = "127.0.0.1:9002".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:9001".parse().unwrap();

    let mut server = Interface::new(MockSocket::new(), config.clone(), logging::discard());
    let mut client = Interface::new(MockSocket::new(), config.clone(), logging::discard());
    let mut noscope = NoScope;

    let client_id = client.connect(server_addr, &[], now).unwrap();

    // A stray hello from an address the server has never seen allocates a
    // pending connection, mirroring what `UdpServerTransport` would report
    // for a real TAG_HELLO datagram.
    server.socket_mut().push_packet(client_addr, Vec::new());
    server.poll(now, &mut noscope, &mut |_, _, _| Ok(()));
    let server_id = ConnectionId(0);
    assert!(server.connection(server_id).is_some());

    server.connection_mut(server_id).unwrap().on_challenge_response().unwrap();
    client.connection_mut(client_id).unwrap().on_challenge_response().unwrap();

    server.socket_mut().push_established(server_id);
    client.socket_mut().push_established(client_id);
    server.poll(now, &mut noscope, &mut |_, _, _| Ok(()));
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));

    assert!(server.connection(server_id).unwrap().is_established());
    assert!(client.connection(client_id).unwrap().is_established());
    assert_eq!(server.changes().collect::<Vec<_>>(), vec![ConnectionChange::Established(server_id)]);
    assert_eq!(client.changes().collect::<Vec<_>>(), vec![ConnectionChange::Established(client_id)]);

    (server, server_id, client, client_id, now)
}

fn relay(from: &mut Interface<MockSocket>, to_id: ConnectionId, to: &mut Interface<MockSocket>) {
    for (_, bytes) in from.socket_mut().take_sent() {
        to.socket_mut().deliver(to_id, bytes);
    }
}

/// One full round trip: server sends, client receives and (in the same
/// `poll`) replies with a packet acking it, server receives that reply.
/// A ghost's create entry blocks further updates to it
/// (`GhostManager::score` returns 0 while `flags.ghosting` is set) until
/// its delivery is actually acked this way, so every test that dirties an
/// object after creating it needs at least one round trip first.
fn sync_round(
    server: &mut Interface<MockSocket>,
    server_id: ConnectionId,
    client: &mut Interface<MockSocket>,
    client_id: ConnectionId,
    now: Instant,
    scope: &mut dyn ScopeSource,
) {
    let mut noscope = NoScope;
    server.poll(now, scope, &mut |_, _, _| Ok(()));
    relay(server, client_id, client);
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));
    relay(client, server_id, server);
    server.poll(now, scope, &mut |_, _, _| Ok(()));
}

#[test]
fn handshake_establishes_both_sides_and_ghosts_a_new_object() {
    let config = Config::default();
    let (mut server, server_id, mut client, client_id, now) = bring_up_pair(&config);

    let session = server.connection_mut(server_id).unwrap().activate_ghosting();
    assert!(server.connection_mut(server_id).unwrap().confirm_ghosting(session));

    let actor_id = ObjectId(501);
    let actor: ObjectRef = Rc::new(RefCell::new(DemoActor { id: actor_id, x: 10, y: 20, dirty: 0 }));
    let mut scope = TestScope { objects: vec![actor] };
    let mut noscope = NoScope;

    server.poll(now, &mut scope, &mut |_, _, _| Ok(()));
    relay(&mut server, client_id, &mut client);
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));

    assert_eq!(latest_mirror(actor_id), Some((10, 20)));
}

#[test]
fn dirty_mask_update_replicates_only_the_changed_field() {
    let config = Config::default();
    let (mut server, server_id, mut client, client_id, now) = bring_up_pair(&config);

    let session = server.connection_mut(server_id).unwrap().activate_ghosting();
    server.connection_mut(server_id).unwrap().confirm_ghosting(session);

    let actor_id = ObjectId(502);
    let actor: ObjectRef = Rc::new(RefCell::new(DemoActor { id: actor_id, x: 1, y: 2, dirty: 0 }));
    let mut scope = TestScope { objects: vec![actor.clone()] };
    let mut noscope = NoScope;

    // Initial create, acked so the update below isn't blocked behind it.
    sync_round(&mut server, server_id, &mut client, client_id, now, &mut scope);
    assert_eq!(latest_mirror(actor_id), Some((1, 2)));

    // Only x changes; the ghost manager must only resend bit 0.
    actor.borrow_mut().x = 99;
    actor.borrow_mut().mark_dirty(0b01);
    server.connection_mut(server_id).unwrap().mark_dirty(actor_id, 0b01);

    server.poll(now, &mut scope, &mut |_, _, _| Ok(()));
    relay(&mut server, client_id, &mut client);
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));

    assert_eq!(latest_mirror(actor_id), Some((99, 2)));
}

#[test]
fn scope_out_destroys_the_mirrored_ghost() {
    let config = Config::default();
    let (mut server, server_id, mut client, client_id, now) = bring_up_pair(&config);

    let session = server.connection_mut(server_id).unwrap().activate_ghosting();
    server.connection_mut(server_id).unwrap().confirm_ghosting(session);

    let actor_id = ObjectId(503);
    let actor: ObjectRef = Rc::new(RefCell::new(DemoActor { id: actor_id, x: 5, y: 5, dirty: 0 }));
    let mut scope = TestScope { objects: vec![actor] };
    let mut noscope = NoScope;

    sync_round(&mut server, server_id, &mut client, client_id, now, &mut scope);
    assert!(!was_removed(actor_id));

    // Drop the object from scope: the next tick should pack a destroy.
    scope.objects.clear();
    server.poll(now, &mut scope, &mut |_, _, _| Ok(()));
    relay(&mut server, client_id, &mut client);
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));

    assert!(was_removed(actor_id));
}

#[test]
fn lost_ghost_update_is_retransmitted_after_aging_out() {
    let mut config = Config::default();
    config.notify_timeout_ms = 20;
    let (mut server, server_id, mut client, client_id, now) = bring_up_pair(&config);

    let session = server.connection_mut(server_id).unwrap().activate_ghosting();
    server.connection_mut(server_id).unwrap().confirm_ghosting(session);

    let actor_id = ObjectId(504);
    let actor: ObjectRef = Rc::new(RefCell::new(DemoActor { id: actor_id, x: 0, y: 0, dirty: 0 }));
    let mut scope = TestScope { objects: vec![actor.clone()] };
    let mut noscope = NoScope;

    sync_round(&mut server, server_id, &mut client, client_id, now, &mut scope);
    assert_eq!(latest_mirror(actor_id), Some((0, 0)));

    actor.borrow_mut().y = 42;
    actor.borrow_mut().mark_dirty(0b10);
    server.connection_mut(server_id).unwrap().mark_dirty(actor_id, 0b10);

    // This send never reaches the client.
    server.socket_mut().drop_next();
    server.poll(now, &mut scope, &mut |_, _, _| Ok(()));
    relay(&mut server, client_id, &mut client);
    client.poll(now, &mut noscope, &mut |_, _, _| Ok(()));
    assert_eq!(latest_mirror(actor_id), Some((0, 0)));

    // Once the update ages out past notify_timeout, the next tick re-sends
    // the still-dirty field.
    let later = now + Duration::from_millis(50);
    server.poll(later, &mut scope, &mut |_, _, _| Ok(()));
    relay(&mut server, client_id, &mut client);
    client.poll(later, &mut noscope, &mut |_, _, _| Ok(()));

    assert_eq!(latest_mirror(actor_id), Some((0, 42)));
}

#[test]
fn connection_times_out_without_traffic() {
    let config = Config::default();
    let (mut server, server_id, _client, _client_id, now) = bring_up_pair(&config);
    let mut scope = NoScope;

    let later = now + config.connection_timeout() + Duration::from_millis(1);
    server.poll(later, &mut scope, &mut |_, _, _| Ok(()));

    assert!(server.connection(server_id).is_none());
    assert_eq!(server.changes().collect::<Vec<_>>(), vec![ConnectionChange::TimedOut(server_id)]);
}

// --- ordered-event reassembly: no socket plumbing needed here ----------

#[derive(Debug, PartialEq)]
struct OrderedPing {
    value: i32,
}

fn write_ping(obj: &dyn Any, s: &mut rillcore::bitstream::BitWriter) -> rillcore::error::NetResult<()> {
    s.write_signed(obj.downcast_ref::<OrderedPing>().unwrap().value, 16)
}
fn read_ping(obj: &mut dyn Any, s: &mut rillcore::bitstream::BitReader) -> rillcore::error::NetResult<()> {
    obj.downcast_mut::<OrderedPing>().unwrap().value = s.read_signed(16)?;
    Ok(())
}
fn make_ping() -> Box<dyn Any> {
    Box::new(OrderedPing { value: 0 })
}

fn register_ordered_ping() -> TypeHandle {
    reflect::register_type(
        TypeDescriptor::new(
            "integration::OrderedPing",
            None,
            vec![FieldDescriptor {
                name: "value",
                state_bit: 0,
                initial: false,
                write: write_ping,
                read: read_ping,
                compare: always_equal,
            }],
        )
        .with_factory(make_ping),
    )
    .unwrap()
}

fn established_connection_pair(config: &Config, now: Instant) -> (Connection, Connection) {
    let mut server = Connection::new(ConnectionId(1), config, true, true, now, logging::discard());
    let mut client = Connection::new(ConnectionId(2), config, false, false, now, logging::discard());
    server.on_challenge_response().unwrap();
    server.establish(now).unwrap();
    client.on_challenge_response().unwrap();
    client.establish(now).unwrap();
    (server, client)
}

#[test]
fn guaranteed_ordered_events_reassemble_after_reorder() {
    let config = Config::default();
    let now = Instant::now();
    let (mut server, mut client) = established_connection_pair(&config, now);
    let mut scope = NoScope;

    let handle = register_ordered_ping();
    server.register_rpc(handle, Direction::ServerToClient, Discipline::GuaranteedOrdered);
    client.register_rpc(handle, Direction::ServerToClient, Discipline::GuaranteedOrdered);

    server.post_event(handle, Discipline::GuaranteedOrdered, Box::new(OrderedPing { value: 1 })).unwrap();
    let packet1 = server.tick(now, &mut scope).unwrap().unwrap();

    server.post_event(handle, Discipline::GuaranteedOrdered, Box::new(OrderedPing { value: 2 })).unwrap();
    let packet2 = server.tick(now, &mut scope).unwrap().unwrap();

    let mut received = Vec::new();

    // Second packet arrives first: its event must be held, not dispatched.
    client
        .receive_packet(now, &packet2, &mut |_, payload| {
            received.push(payload.downcast::<OrderedPing>().unwrap().value);
            Ok(())
        })
        .unwrap();
    assert!(received.is_empty());

    // First packet arrives late: this releases both, in order.
    client
        .receive_packet(now, &packet1, &mut |_, payload| {
            received.push(payload.downcast::<OrderedPing>().unwrap().value);
            Ok(())
        })
        .unwrap();

    assert_eq!(received, vec![1, 2]);
}
