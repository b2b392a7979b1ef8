//! Command-line interface definitions

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use zlayer_relay::KeyStrategy;

use crate::logging::LogFormat;

/// ZLayer relay broker and tunnel agent
#[derive(Debug, Parser)]
#[command(name = "zlayer-relay")]
#[command(version, about = "Publish local HTTP APIs through a relay broker")]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "ZLAYER_RELAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Run the relay broker
    Serve {
        /// Bind address (e.g., 0.0.0.0:8080)
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Port to listen on, overriding the port of the bind address
        #[arg(long, env = "PORT")]
        port: Option<u16>,

        /// Externally visible base URL used in registration responses
        #[arg(long, env = "ZLAYER_RELAY_PUBLIC_URL")]
        public_url: Option<String>,

        /// Key allocation strategy (random or sequential)
        #[arg(long)]
        key_strategy: Option<KeyStrategy>,
    },

    /// Connect a local API to a relay broker through a tunnel
    Connect {
        /// Relay base URL (http, https, ws or wss)
        #[arg(long, env = "ZLAYER_RELAY_SERVER")]
        server: String,

        /// Key returned by registration
        #[arg(long)]
        key: String,

        /// Base URL of the local API
        #[arg(long)]
        local_api: String,
    },

    /// Register an origin with a relay broker
    Register {
        /// Relay base URL
        #[arg(long, env = "ZLAYER_RELAY_SERVER", default_value = "http://localhost:8080")]
        server: String,

        /// Origin URL for direct fetch
        #[arg(long, conflicts_with = "relay", required_unless_present = "relay")]
        local_api: Option<String>,

        /// Register a tunnel origin instead of a direct one
        #[arg(long)]
        relay: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_serve() {
        let cli = Cli::try_parse_from([
            "zlayer-relay",
            "-vv",
            "serve",
            "--bind",
            "127.0.0.1:9000",
            "--key-strategy",
            "sequential",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Serve {
                bind, key_strategy, ..
            } => {
                assert_eq!(bind, Some("127.0.0.1:9000".parse().unwrap()));
                assert_eq!(key_strategy, Some(KeyStrategy::Sequential));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_register_requires_target() {
        assert!(Cli::try_parse_from(["zlayer-relay", "register"]).is_err());
        assert!(Cli::try_parse_from(["zlayer-relay", "register", "--relay"]).is_ok());
        assert!(Cli::try_parse_from([
            "zlayer-relay",
            "register",
            "--relay",
            "--local-api",
            "http://localhost:3000"
        ])
        .is_err());
    }
}
