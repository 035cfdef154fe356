//! chatq - lease-based per-conversation message queue.

use clap::Parser;
use std::process::ExitCode;

use chatq::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    // Run the command; logging is set up once settings are loaded
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
