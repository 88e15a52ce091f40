mod cli;
mod connection;
mod engine;
mod error;
mod extract;
mod model;
mod orchestrator;
mod progress;
mod settings;
mod storage;
mod text_summary;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_silent = args.silent;

    // Logs go to stderr so stdout stays clean for --json.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli::run(args).await {
        Ok(()) => {
            // Explicitly exit with code 0; the Ctrl-C listener may still be parked.
            std::process::exit(0);
        }
        Err(e) => {
            if is_silent {
                println!("{}", e);
                std::process::exit(1);
            } else {
                Err(e)
            }
        }
    }
}
