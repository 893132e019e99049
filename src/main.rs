mod cli;
mod config;
mod error;
mod logging;
mod model;
mod orchestrator;
mod phrases;
mod sink;
mod status;
mod supervisor;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.verbose);

    let code = cli::run(args).await?;
    // Exit explicitly: a session's stdin reader may still be parked on a
    // blocking read that would otherwise hold the runtime open.
    std::process::exit(code)
}
