//! Command-line interface definitions for `session-gateway`.
//!
//! Defines the top-level [`Cli`] struct parsed by `clap` and the
//! [`Command`] subcommand enum that drives the binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Federated authentication and session service for game servers and clients
///
/// Issues short-lived Ed25519-signed identity and access tokens, publishes
/// verification keys through JWKS discovery, and binds each token's issuer
/// to the hostname the request arrived under.
///
/// Run without a subcommand to start the server.
#[derive(Parser, Debug)]
#[command(name = "session-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file (YAML)
    #[arg(short, long, env = "SESSION_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port the server listens on (overrides config file)
    #[arg(short, long, env = "SESSION_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host address to bind to (overrides config file)
    #[arg(long, env = "SESSION_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Minimum log level: trace, debug, info, warn, or error
    #[arg(
        long,
        default_value = "info",
        env = "SESSION_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log output format: "text" for human-readable, "json" for structured
    #[arg(long, env = "SESSION_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand to run (defaults to server mode when omitted)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the session gateway server (default when no subcommand is given)
    #[command(about = "Start the session gateway server")]
    Serve,

    /// Generate and persist the signing-key record ahead of first start
    #[command(about = "Generate the signing-key record")]
    Keygen {
        /// Where to write the key record (defaults to the configured path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate a starter configuration file with documented defaults
    #[command(about = "Create a new configuration file")]
    Init {
        /// File path to write the generated configuration to
        #[arg(short, long, default_value = "session-gateway.yaml")]
        output: PathBuf,
    },
}
