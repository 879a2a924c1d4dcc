//! Thin binary counterpart to `rillserver`: connects over UDP and logs
//! connection and ghost/event activity as it arrives. All protocol work -
//! the handshake, the notify window, ghost unpacking - happens inside
//! `rillcore`; this binary only owns the socket and the driver loop.

mod transport;

use clap::{App, Arg};
use rillcore::config::Config;
use rillcore::interface::{ConnectionChange, Interface};
use rillcore::logging;
use rillcore::object::{ConnectionId, ScopeQuery, ScopeSource};
use std::thread;
use std::time::Instant;

use transport::UdpClientTransport;

struct NoScope;
impl ScopeSource for NoScope {
    fn perform_scope_query(&mut self, _connection: ConnectionId, _query: &mut dyn ScopeQuery) {}
}

fn main() {
    let matches = App::new("rillclient")
        .version("0.1")
        .about("Connects to a rillserver instance over UDP.")
        .arg(Arg::with_name("SERVER").help("Server address, e.g. 127.0.0.1:7777").required(true))
        .get_matches();

    let server_address = matches.value_of("SERVER").unwrap().parse().expect("invalid server address");

    let log = logging::terminal(logging::Severity::Debug);
    let config = Config::default();

    let transport = UdpClientTransport::new().expect("failed to open UDP socket");
    let mut interface = Interface::new(transport, config.clone(), log.clone());

    let now = Instant::now();
    let connection_id = interface.connect(server_address, &[], now).expect("connect failed");
    logging::info!(log, "connecting"; "server" => %server_address, "connection_id" => connection_id.0);

    let mut scope = NoScope;
    loop {
        let now = Instant::now();
        interface.poll(now, &mut scope, &mut |connection, handle, _payload| {
            logging::trace!(log, "event received"; "connection_id" => connection.0, "type_handle" => handle.0);
            Ok(())
        });

        for change in interface.changes() {
            match change {
                ConnectionChange::Established(id) => logging::info!(log, "connection established"; "connection_id" => id.0),
                ConnectionChange::Disconnected(id) => {
                    logging::info!(log, "connection disconnected"; "connection_id" => id.0);
                    return;
                }
                ConnectionChange::TimedOut(id) => {
                    logging::info!(log, "connection timed out"; "connection_id" => id.0);
                    return;
                }
            }
        }

        thread::sleep(config.tick_period());
    }
}
