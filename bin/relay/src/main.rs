//! zlayer-relay - relay broker and tunnel agent
//!
//! `serve` runs the broker, `connect` runs an agent next to a local API and
//! `register` allocates a public key on a running broker.

mod cli;
mod commands;
mod config;
mod logging;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::serve::ServeOverrides;
use crate::config::FileConfig;
use crate::logging::LogLevel;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut file_config = FileConfig::load(cli.config.as_deref())?;
    if let Some(level) = LogLevel::from_verbosity(cli.verbose) {
        file_config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        file_config.logging.format = format;
    }
    logging::init_logging(&file_config.logging)?;

    match cli.command {
        Commands::Serve {
            bind,
            port,
            public_url,
            key_strategy,
        } => {
            let overrides = ServeOverrides {
                bind,
                port,
                public_url,
                key_strategy,
            };
            commands::serve(file_config.server, overrides).await
        }
        Commands::Connect {
            server,
            key,
            local_api,
        } => commands::connect(&server, &key, &local_api).await,
        Commands::Register {
            server,
            local_api,
            relay,
        } => commands::register(&server, local_api, relay).await,
    }
}
