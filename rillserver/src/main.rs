//! Thin binary gluing `rillcore` to a real UDP socket: binds a server
//! port, accepts connections, ghosts one demo object to everyone, and logs
//! connection and event traffic. The driver loop itself - poll, tick,
//! sleep - is the single-threaded cooperative model from spec section 5;
//! all the actual protocol work lives in the library.

mod transport;

use clap::{App, Arg};
use rillcore::config::Config;
use rillcore::interface::{ConnectionChange, Interface};
use rillcore::logging;
use rillcore::object::{ConnectionId, ObjectId, ObjectRef, ScopeQuery, ScopeSource};
use rillcore::Replicated;
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Instant;

use transport::UdpServerTransport;

#[derive(Replicated, Default)]
struct Position {
    #[replicated(id)]
    id: ObjectId,
    #[replicated(bits = 16)]
    x: i32,
    #[replicated(bits = 16)]
    y: i32,
    dirty_mask: u32,
}

/// Every connection sees the same one demo object in scope - spec's
/// "object_local_scope_always" simplification for a binary with nothing
/// resembling zones or interest management yet.
struct AlwaysInScope {
    object: ObjectRef,
}

impl ScopeSource for AlwaysInScope {
    fn perform_scope_query(&mut self, _connection: ConnectionId, query: &mut dyn ScopeQuery) {
        query.object_in_scope(&self.object);
    }
}

fn main() {
    let matches = App::new("rillserver")
        .version("0.1")
        .about("Runs a demo rillcore server over UDP.")
        .arg(Arg::with_name("BIND").help("Address to bind, e.g. 0.0.0.0:7777").required(true))
        .get_matches();

    let bind_address = matches.value_of("BIND").unwrap();

    let log = logging::terminal(logging::Severity::Debug);
    let config = Config::default();

    let transport = UdpServerTransport::bind(bind_address).expect("failed to bind UDP socket");
    let mut interface = Interface::new(transport, config.clone(), log.clone());

    let object: ObjectRef = Rc::new(RefCell::new(Position { id: ObjectId(0), x: 5, y: 5, dirty_mask: 0 }));
    let mut scope = AlwaysInScope { object };

    logging::info!(log, "rillserver listening"; "address" => bind_address);

    loop {
        let now = Instant::now();
        interface.poll(now, &mut scope, &mut |connection, handle, _payload| {
            logging::trace!(log, "event received"; "connection_id" => connection.0, "type_handle" => handle.0);
            Ok(())
        });

        let changes: Vec<ConnectionChange> = interface.changes().collect();
        for change in changes {
            match change {
                ConnectionChange::Established(id) => {
                    logging::info!(log, "connection established"; "connection_id" => id.0);
                    if let Some(connection) = interface.connection_mut(id) {
                        let session = connection.activate_ghosting();
                        logging::debug!(log, "ghosting activated"; "connection_id" => id.0, "session" => session);
                        connection.confirm_ghosting(session);
                    }
                }
                ConnectionChange::Disconnected(id) => {
                    logging::info!(log, "connection disconnected"; "connection_id" => id.0);
                }
                ConnectionChange::TimedOut(id) => {
                    logging::info!(log, "connection timed out"; "connection_id" => id.0);
                }
            }
        }

        thread::sleep(config.tick_period());
    }
}
