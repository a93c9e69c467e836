//! Cilantro CLI: runs a node and manages its identity and authorized peers.

mod cli;
mod cmd;
mod config;

use crate::cli::*;
use clap::Parser;

fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let loaded = config::load_config(cli.config.as_deref());
    init_tracing(&loaded.config.log_level);
    if let Some(warning) = &loaded.warning {
        tracing::warn!(path = %loaded.path.display(), "{warning}");
    }
    let config = loaded.config;

    match cli.command {
        Commands::Run => cmd::node::cmd_run(config),
        Commands::Keys(sub) => match sub {
            KeysCommands::Generate { json } => cmd::keys::cmd_keys_generate(json),
            KeysCommands::Show { json } => cmd::keys::cmd_keys_show(&config, json),
        },
        Commands::Auth(sub) => match sub {
            AuthCommands::Add { vk, domain } => cmd::auth::cmd_auth_add(&config, &vk, &domain),
            AuthCommands::Remove { vk, domain } => {
                cmd::auth::cmd_auth_remove(&config, &vk, &domain)
            }
            AuthCommands::List { domain } => cmd::auth::cmd_auth_list(&config, &domain),
        },
        Commands::Send(args) => cmd::send::cmd_send(config, args),
    }
}
