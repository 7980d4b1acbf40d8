//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset: operators want to see
/// the mount lifecycle, but not every spawned command.
const DEFAULT_DIRECTIVES: &str = "info";

/// Initialize tracing with the default configuration.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Log to stderr by default; stdout belongs to inspect/list output
    tracing_subscriber::fmt()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}
