mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr } => commands::serve::run(addr).await?,
        Commands::Check => commands::check::run().await?,
        Commands::Keys { api_url, action } => commands::keys::run(&api_url, action).await?,
        Commands::Version => commands::version::run()?,
    }

    Ok(())
}
