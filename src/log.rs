//! Logging setup.
//!
//! Everything logs through `tracing`. The subscriber writes to stderr so
//! stdout stays free for the JSON event stream.
//!
//! Filter precedence: `RUST_LOG` if set, otherwise `debug` when the
//! `--debug` flag or `CREWRUN_DEBUG=1` is given, otherwise `info`.

use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "CREWRUN_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug, env_debug())));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(flag: bool, env: bool) -> &'static str {
    if flag || env {
        "debug"
    } else {
        "info"
    }
}
