//! Root logger construction. Every long-lived object (channel, key state, session,
//! client instance) derives a child logger from this root with `log.new(o!())` and
//! attaches its own identifying fields from there.

pub use slog::{debug, error, info, o, trace, warn, Discard, Drain, Logger};

/// Builds the root logger from a fixed terminal-output config. A real deployment
/// would read this from the daemon's own config file; the core only needs the one
/// bootstrap entry point.
pub fn init() -> Logger {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("invalid built-in logging config");

    config.build_logger().expect("failed to build logger")
}

/// A logger that discards everything, for contexts (unit tests, library consumers
/// that don't care) that never wired up a real root logger.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
