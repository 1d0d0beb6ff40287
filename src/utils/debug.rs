//! Logging setup.

use tracing_subscriber::EnvFilter;

/// Environment variable that turns on debug output when the `--debug` flag
/// is not passed. The flag and the variable are equivalent; either wins.
pub const SLIPWAY_DEBUG_ENV: &str = "SLIPWAY_DEBUG";

/// Install the global tracing subscriber, once per process. Later calls are
/// no-ops, which keeps test binaries from panicking on double init.
pub fn init_debug_logging(debug_flag: bool) {
    let debug_enabled = debug_flag || std::env::var(SLIPWAY_DEBUG_ENV).is_ok();

    let filter = if debug_enabled {
        EnvFilter::new("slipway=debug,warn")
    } else {
        EnvFilter::new("slipway=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(debug_enabled)
        .with_ansi(true)
        .try_init()
        .ok();
}
