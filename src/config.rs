use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "replistore",
    about = "Replicated SQL store for configuration services",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the replication node (default).
    Run,

    /// Create the on-disk layout under --data-dir without starting the node.
    Init,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Node data directory (store, raft log, snapshots).
    #[arg(long, global = true, value_name = "DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// This node's Raft id.
    #[arg(long, global = true, value_name = "ID", default_value_t = 1)]
    pub node_id: u64,

    /// Human-friendly node name used in membership metadata.
    #[arg(long, global = true, value_name = "NAME", default_value = "node-1")]
    pub node_name: String,

    /// Raft RPC listener bind address.
    #[arg(
        long,
        global = true,
        value_name = "ADDR",
        default_value = "127.0.0.1:7181"
    )]
    pub raft_bind: SocketAddr,

    /// Raft RPC base URL peers use to reach this node.
    #[arg(
        long,
        global = true,
        value_name = "URL",
        default_value = "http://127.0.0.1:7181"
    )]
    pub advertise_url: String,

    /// Replication group / cluster name.
    #[arg(long, global = true, value_name = "NAME", default_value = "replistore")]
    pub cluster_name: String,

    /// Bootstrap a fresh single-node cluster if the node is uninitialized.
    #[arg(long, global = true, default_value_t = false)]
    pub bootstrap: bool,

    /// Upper bound for a synchronous write, in milliseconds. A write that
    /// exceeds it surfaces a timeout-specific failure (it may still commit).
    #[arg(long, global = true, value_name = "MS", default_value_t = 10_000)]
    pub write_timeout_ms: u64,
}

impl Config {
    pub fn node_meta(&self) -> crate::raft::NodeMeta {
        crate::raft::NodeMeta {
            name: self.node_name.clone(),
            raft_endpoint: self.advertise_url.clone(),
        }
    }

    pub fn write_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.write_timeout_ms)
    }
}
