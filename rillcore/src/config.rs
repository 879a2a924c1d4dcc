//! Per-connection tunables. Spec leaves window size, timeouts, `max_ghosts`
//! and the packing padding margin as "a connection constant" - this is
//! that constant, loadable from a TOML file the way `gamecore::config`
//! loads `GameConfig`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default ghost id width from the original engine (`ghost_id_bit_size`):
/// 10 bits, 1024 ghosts per connection.
pub const DEFAULT_MAX_GHOSTS: usize = 1024;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Outstanding-datagram window size for the notify protocol.
    pub notify_window: usize,
    /// A notify entry older than this is declared lost.
    pub notify_timeout_ms: u64,
    /// No traffic at all for this long declares the connection timed out.
    pub connection_timeout_ms: u64,
    /// Maximum number of ghosts resident on one connection at a time.
    pub max_ghosts: usize,
    /// Bytes available in one outgoing datagram.
    pub max_packet_size: usize,
    /// Bits that must remain free after any single write for packing to
    /// keep going; once less than this remains, the current write is
    /// rewound and packing stops for the datagram.
    pub min_padding_bits: usize,
    /// Target period between `tick` calls.
    pub tick_period_ms: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            notify_window: 32,
            notify_timeout_ms: 2_000,
            connection_timeout_ms: 15_000,
            max_ghosts: DEFAULT_MAX_GHOSTS,
            max_packet_size: 1400,
            min_padding_bits: 16,
            tick_period_ms: 32,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("error loading network configuration file")
    }

    #[inline]
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    #[inline]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    #[inline]
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// Number of bits needed to index a ghost: `ceil(log2(max_ghosts))`,
    /// transmitted on the wire as `value + 3` per spec 6.
    #[inline]
    pub fn ghost_index_bits(&self) -> u32 {
        crate::bitstream::bits_for_range(0, (self.max_ghosts.max(1) - 1) as i64)
    }
}
