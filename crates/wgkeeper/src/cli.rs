//! Clap derive structures for the `wgkeeper` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// wgkeeper -- WireGuard peer provisioning for RouterOS
#[derive(Debug, Parser)]
#[command(
    name = "wgkeeper",
    version,
    about = "Provision and reconcile WireGuard peers on RouterOS devices",
    long_about = "Keeps peer records, router configuration, and the set of valid users\n\
        in agreement. `serve` runs the reconciliation loop; the `peer` commands\n\
        act on the same state file for one-off changes.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file
    #[arg(long, short = 'c', env = "WGKEEPER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table", global = true)]
    pub output: OutputFormat,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker and the reconciliation loop until interrupted
    Serve,

    /// Create, inspect, and remove peers
    #[command(alias = "peers")]
    Peer(PeerArgs),

    /// Show tunnel interfaces and address usage
    Tunnels,

    /// Inspect the configuration
    Config(ConfigArgs),
}

// ── Peers ────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct PeerArgs {
    #[command(subcommand)]
    pub command: PeerCommand,
}

#[derive(Debug, Subcommand)]
pub enum PeerCommand {
    /// Create a peer and provision it
    Create {
        /// Owner of the peer
        username: String,

        /// Tunnel name
        #[arg(long, short = 't')]
        tunnel: String,

        /// Profile within the tunnel
        #[arg(long, short = 'p', default_value = "default")]
        profile: String,

        /// Free-text description stored in the device comment
        #[arg(long, short = 'd')]
        description: Option<String>,

        /// Base64 preshared key (32 bytes)
        #[arg(long)]
        preshared_key: Option<String>,
    },

    /// List peers
    #[command(alias = "ls")]
    List {
        /// Only peers of this user
        #[arg(long, short = 'u')]
        user: Option<String>,
    },

    /// Show one peer
    Get { id: String },

    /// Delete a peer
    #[command(alias = "rm")]
    Delete {
        id: String,

        /// Skip removal from the device
        #[arg(long)]
        force: bool,
    },

    /// Retry provisioning of a peer
    Reprovision { id: String },

    /// Print the WireGuard client configuration of a peer
    Config { id: String },
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Load and validate the configuration
    Check,

    /// Print the effective configuration with secrets redacted
    Show,

    /// Print the configuration file path
    Path,
}
