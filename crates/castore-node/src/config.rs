//! Node configuration loaded from TOML or JSON.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeError, NodeResult};

/// Gossip settings for the memberlist listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemberlistConfig {
    /// Port of the gossip listener.
    pub port: u16,
    /// Milliseconds between gossip rounds.
    pub interval_ms: u64,
    /// Consecutive failed probes before a peer is suspected.
    pub suspect_after: u32,
    /// Consecutive failed probes before a peer is removed.
    pub dead_after: u32,
}

impl Default for MemberlistConfig {
    fn default() -> Self {
        Self {
            port: 7946,
            interval_ms: 1000,
            suspect_after: 3,
            dead_after: 6,
        }
    }
}

impl MemberlistConfig {
    /// Gossip round interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Dashboard settings. Parsed and echoed only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard port.
    pub port: u16,
    /// Whether the dashboard is enabled.
    pub enabled: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            enabled: false,
        }
    }
}

/// Effective configuration of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP port of the storing service.
    pub port: u16,
    /// Address the listeners bind to and peers are told to use.
    pub host: String,
    /// Volume root directories.
    pub volumes: Vec<PathBuf>,
    /// Per-volume capacity in bytes; unbounded when absent.
    pub volume_size: Option<u64>,
    /// Memberlist address (`host:port`) of a seed node.
    pub remote: Option<String>,
    /// Default replica count for writes; negative disables replication.
    pub replica: i32,
    /// Node name, unique in the cluster.
    pub name: String,
    /// Gossip settings.
    pub memberlist: MemberlistConfig,
    /// Dashboard settings.
    pub dashboard: DashboardConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: String::from("127.0.0.1"),
            volumes: Vec::new(),
            volume_size: None,
            remote: None,
            replica: -1,
            name: uuid::Uuid::new_v4().to_string(),
            memberlist: MemberlistConfig::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Loads a configuration file, choosing the format by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: NodeConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: NodeConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Rejects configurations a node cannot start with.
    pub fn validate(&self) -> NodeResult<()> {
        if self.volumes.is_empty() {
            return Err(NodeError::Config("at least one volume is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(NodeError::Config("node name must not be empty".into()));
        }
        if self.memberlist.interval_ms == 0 {
            return Err(NodeError::Config("memberlist.interval_ms must be positive".into()));
        }
        if self.memberlist.suspect_after == 0 || self.memberlist.dead_after < self.memberlist.suspect_after {
            return Err(NodeError::Config(
                "memberlist.dead_after must be at least memberlist.suspect_after, both positive".into(),
            ));
        }
        Ok(())
    }

    /// Replica count applied to writes that do not ask for one.
    pub fn default_replica(&self) -> u32 {
        u32::try_from(self.replica).unwrap_or(0)
    }

    /// Address of the storing service listener.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address of the gossip listener.
    pub fn memberlist_addr(&self) -> String {
        format!("{}:{}", self.host, self.memberlist.port)
    }
}
