use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "corral",
    about = "Control plane for a distributed node-management fleet",
    version
)]
pub struct Cli {
    /// Connect to a remote corral server instead of running in-process.
    #[arg(long, env = "CORRAL_URL", global = true)]
    pub remote: Option<String>,

    /// Bearer token for remote commands.
    #[arg(long, env = "CORRAL_TOKEN", global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the control-plane server.
    Serve {
        /// Path to corral.yml. Defaults apply when absent.
        #[arg(long, env = "CORRAL_CONFIG")]
        config: Option<PathBuf>,

        /// Override the configured bind address.
        #[arg(long)]
        bind: Option<String>,

        /// Override the configured port.
        #[arg(long)]
        port: Option<u16>,

        /// Override (or provide) the bearer token.
        #[arg(long, env = "CORRAL_AUTH_TOKEN")]
        auth_token: Option<String>,
    },

    /// Show pipeline and isolate health.
    Status,

    /// Walk the committed audit chain and verify every hash link.
    Verify {
        /// Maximum number of logs to verify.
        #[arg(long, default_value_t = 10_000)]
        limit: usize,
    },

    /// Send a join request (development convenience).
    Join {
        /// 64-hex hardware fingerprint.
        hwid: String,

        /// Hostname presented by the node.
        #[arg(long, default_value = "dev-node")]
        hostname: String,

        /// Node persona.
        #[arg(long, default_value = "agent")]
        persona: PersonaArg,
    },
}

#[derive(Debug, Clone, ValueEnum)]
pub enum PersonaArg {
    Agent,
    Gig,
}
