//! Clap CLI definitions for Cilantro.

use clap::{Args, Parser, Subcommand, ValueEnum};
use cilantro_types::config::SocketKindSpec;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  cilantro keys generate              Create a new node identity
  cilantro run                        Start the node from ~/.cilantro/config.toml
  cilantro auth add <vk> -d delegates Authorize a peer in a security domain
  cilantro send --vk <vk> --port 9000 blocks new 42";

/// Cilantro node: identity-addressed messaging between network participants.
#[derive(Parser)]
#[command(name = "cilantro", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the node: open configured sockets and run until Ctrl+C.
    Run,
    /// Manage the node identity (generate, show) [*].
    #[command(subcommand)]
    Keys(KeysCommands),
    /// Manage authorized peer keys (add, remove, list) [*].
    #[command(subcommand)]
    Auth(AuthCommands),
    /// Send one message to a peer and exit.
    Send(SendArgs),
}

#[derive(Subcommand)]
pub enum KeysCommands {
    /// Generate a fresh signing key.
    Generate {
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
    },
    /// Show the configured identity.
    Show {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Authorize a peer's verifying key.
    Add {
        vk: String,
        #[arg(long, short = 'd', default_value = "*")]
        domain: String,
    },
    /// Revoke a peer's verifying key.
    Remove {
        vk: String,
        #[arg(long, short = 'd', default_value = "*")]
        domain: String,
    },
    /// List authorized encryption keys.
    List {
        #[arg(long, short = 'd', default_value = "*")]
        domain: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Broadcast,
    Router,
}

impl From<KindArg> for SocketKindSpec {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Broadcast => SocketKindSpec::Broadcast,
            KindArg::Router => SocketKindSpec::Router,
        }
    }
}

#[derive(Args)]
pub struct SendArgs {
    /// Peer address. Takes precedence over `--vk` for dialing.
    #[arg(long)]
    pub ip: Option<String>,
    /// Peer verifying key, resolved through the configured peer directory.
    #[arg(long)]
    pub vk: Option<String>,
    #[arg(long)]
    pub port: u16,
    /// `tcp` or `ipc`.
    #[arg(long, default_value = "tcp")]
    pub protocol: String,
    #[arg(long, value_enum, default_value_t = KindArg::Broadcast)]
    pub kind: KindArg,
    /// Upgrade to an encrypted channel (needs `--vk` and a signing key).
    #[arg(long)]
    pub secure: bool,
    #[arg(long, default_value = "*")]
    pub domain: String,
    /// Destination identity for router sockets.
    #[arg(long)]
    pub to: Option<String>,
    /// Seconds to wait for the connection.
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,
    pub header: String,
    pub msg_type: String,
    pub payload: String,
}
