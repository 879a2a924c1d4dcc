//! Thin re-export layer over `slog`: threads a `Logger` through
//! constructors and calls the macros by fully qualified path
//! (`logging::debug!`, `logging::trace!`) instead of `#[macro_use]`.

pub use slog::{debug, error, info, o, trace, warn, Logger};

pub use sloggers::types::Severity;

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::Build;

/// Builds a default terminal logger at the given severity. Used by the demo
/// binaries and by tests that want to see what the driver loop is doing;
/// library code never calls this itself, it only accepts a `Logger`.
pub fn terminal(level: Severity) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(level);
    builder.destination(Destination::Stderr);
    builder.build().expect("terminal logger construction cannot fail")
}

/// A logger that discards everything, used as the default when no logger is
/// supplied to a constructor.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
