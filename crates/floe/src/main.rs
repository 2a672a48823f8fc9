//! Floe CLI: create, feed, read and drop upsert tables.

use std::process::ExitCode;

use clap::Parser;

use floe::cli::{CliArgs, run};
use floe::init_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let args = CliArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
