//! Diagnostic logging setup
//!
//! `HATCH_LOG` takes an `EnvFilter` directive (`hatch_common=debug`,
//! `trace`, ...). Without it the level is `info`, or `debug` with `-v`.
//! Everything goes to stderr so command output on stdout stays clean.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "HATCH_LOG";

pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
