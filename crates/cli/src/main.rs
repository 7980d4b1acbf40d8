//! The main entrypoint for rootpatch, which just performs global initialization, and then
//! calls out into the library.
use std::io::Write;

use anyhow::Result;
use owo_colors::OwoColorize;

async fn run() -> Result<()> {
    rootpatch_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    rootpatch_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run().await {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(rootpatch_lib::exit_code(&e));
    }
}
