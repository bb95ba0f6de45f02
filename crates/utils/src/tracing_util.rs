//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration; the `RUST_LOG`
/// environment variable overrides the default of `warn`. Output goes
/// to stderr so stdout stays machine-consumable (e.g. `list`).
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
