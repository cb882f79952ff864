use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "livelink")]
#[command(about = "A resilient live-update client that keeps state across reconnects and updates")]
pub struct Cli {
    /// Configuration file to use instead of the default location
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Connect to a live-update server and stay connected
    ///
    /// Runs until interrupted with Ctrl-C, reconnecting automatically on
    /// failures. Diagnostics are printed on exit.
    ///
    /// Examples:
    ///   livelink connect
    ///   livelink connect --host 192.168.1.20 --port 9000 --register
    ///   livelink connect --no-reconnect --no-heartbeat
    Connect(ConnectArgs),

    /// Inspect or clear persisted state snapshots
    Snapshots {
        #[command(subcommand)]
        command: SnapshotCommand,
    },

    /// Show or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConnectArgs {
    /// Server host (overrides the configuration file)
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// URL path announced in the handshake
    #[arg(long)]
    pub path: Option<String>,

    /// Client identifier
    #[arg(long)]
    pub client_id: Option<String>,

    /// Human-readable client name
    #[arg(long)]
    pub client_name: Option<String>,

    /// Do not reconnect automatically after failures
    #[arg(long)]
    pub no_reconnect: bool,

    /// Disable heartbeat probes
    #[arg(long)]
    pub no_heartbeat: bool,

    /// Send a client registration once connected
    #[arg(long)]
    pub register: bool,

    /// Disconnect after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration: Option<u64>,
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// List persisted snapshots, oldest first
    List,
    /// Show snapshot statistics
    Stats,
    /// Export snapshot diagnostics as JSON
    Export {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete every persisted snapshot
    Clear {
        /// Skip the confirmation
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the configuration file path
    Path,
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}
