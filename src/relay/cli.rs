// CLI commands for the gatekeeper relay

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Gatekeeper relay CLI
#[derive(Debug, Parser)]
#[command(name = "gkrelay")]
#[command(about = "Inter-cloud gatekeeper messaging through a shared relay broker")]
pub struct RelayCli {
    #[command(subcommand)]
    pub command: RelayCommand,
}

/// Settings shared by the protocol commands
#[derive(Debug, Clone, Args)]
pub struct ClientArgs {
    /// JSON client configuration (overrides --name, --key and --timeout)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Common name of the local cloud
    #[arg(short, long)]
    pub name: Option<String>,

    /// Private key of the local cloud (default: <state dir>/keys/<name>.pem)
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Relay broker as host:port
    #[arg(short, long, default_value = "127.0.0.1:61616")]
    pub relay: String,

    /// Connect with TLS (requires a config with a tls section)
    #[arg(long)]
    pub secure: bool,

    /// Per-phase timeout in milliseconds
    #[arg(short, long, default_value = "30000")]
    pub timeout: u64,
}

/// Relay subcommands
#[derive(Debug, Subcommand)]
pub enum RelayCommand {
    /// Generate a key pair for a cloud
    Keygen {
        /// Cloud common name
        name: String,

        /// Output file (default: <state dir>/keys/<name>.pem)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },

    /// Run a relay broker
    Broker {
        /// JSON broker configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Seconds a queued message waits for a consumer
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Answer requests addressed to this cloud
    Listen {
        #[command(flatten)]
        client: ClientArgs,

        /// Stop after this many answered requests
        #[arg(long)]
        count: Option<usize>,
    },

    /// Advertise to a peer cloud and send it one request
    Advertise {
        #[command(flatten)]
        client: ClientArgs,

        /// Common name of the peer cloud
        #[arg(short, long)]
        peer: String,

        /// Peer public key: base64, PEM, or a file containing either
        #[arg(long)]
        peer_key: String,

        /// Request kind (gsd_poll, multi_gsd_poll, icn_proposal, access_type, system_address_list, qos_relay_test)
        #[arg(long, default_value = "access_type")]
        kind: String,

        /// JSON request payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Choose a relay for a cloud
    SelectRelay {
        /// JSON matchmaking parameters
        #[arg(short, long)]
        params: PathBuf,

        /// JSON array of public relays
        #[arg(long)]
        public: Option<PathBuf>,

        /// Strategy (first-available, random-exclusive-preferred, common-preferred-first, gatekeeper-only)
        #[arg(short, long, default_value = "random-exclusive-preferred")]
        strategy: String,
    },
}

impl RelayCli {
    /// Get the state directory
    pub fn state_dir() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(".gkrelay")
    }

    /// Default key location of a cloud
    pub fn key_path(name: &str) -> PathBuf {
        Self::state_dir().join("keys").join(format!("{name}.pem"))
    }
}
