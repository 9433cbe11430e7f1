mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, bind, port, auth_token } => {
            if cli.remote.is_some() {
                anyhow::bail!("serve does not support --remote; run the server locally");
            }
            commands::serve(config, bind, port, auth_token).await
        }
        Command::Status => commands::status(cli.remote, cli.token).await,
        Command::Verify { limit } => commands::verify(cli.remote, cli.token, limit).await,
        Command::Join { hwid, hostname, persona } => {
            commands::join(cli.remote, cli.token, hwid, hostname, persona).await
        }
    }
}
