//! The bootstick binary: everything lives in bootstick-lib.

use anyhow::Result;

async fn run() -> Result<()> {
    bootstick_utils::initialize_tracing();
    tracing::trace!("starting");
    bootstick_lib::cli::run_from_iter(std::env::args_os()).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // The sole user-facing diagnostic for a failed command; the
        // full cause chain, not just the outermost context.
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
