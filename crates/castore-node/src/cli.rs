//! Command line interface of the `castore` binary.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::config::NodeConfig;

#[derive(Parser)]
#[command(name = "castore")]
#[command(about = "Distributed content-addressed object store", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "CASTORE_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a storage node.
    Serve(ServeArgs),
    /// Print the effective configuration as JSON.
    Config(ServeArgs),
}

/// Configuration file plus per-field overrides.
#[derive(Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// TOML or JSON configuration file.
    #[arg(short, long, env = "CASTORE_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP port of the storing service.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Volume root directory; repeat for several volumes.
    #[arg(short, long = "volume")]
    pub volumes: Vec<PathBuf>,

    /// Memberlist address of a seed node.
    #[arg(short, long)]
    pub remote: Option<String>,

    /// Default replica count; negative disables replication.
    #[arg(long, allow_hyphen_values = true)]
    pub replica: Option<i32>,

    /// Node name.
    #[arg(short, long)]
    pub name: Option<String>,

    /// Port of the gossip listener.
    #[arg(long)]
    pub memberlist_port: Option<u16>,
}

impl ServeArgs {
    /// Loads the configuration file, if any, and applies the overrides.
    pub fn load(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_file(path)?,
            None => NodeConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if !self.volumes.is_empty() {
            config.volumes = self.volumes.clone();
        }
        if let Some(remote) = &self.remote {
            config.remote = Some(remote.clone());
        }
        if let Some(replica) = self.replica {
            config.replica = replica;
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(port) = self.memberlist_port {
            config.memberlist.port = port;
        }
        Ok(config)
    }
}
