//! Cluster membership and timing configuration.
//!
//! Every node starts from the same cluster document: a client endpoint and
//! the full list of consensus servers. A node finds its own identity by
//! matching its startup id against the list.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::log::ServerId;

/// A host/port pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One consensus server in the cluster document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: ServerId,
    pub host: String,
    pub port: u16,
}

impl ServerEntry {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The cluster document, identical on every node at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub client: Endpoint,
    pub servers: Vec<ServerEntry>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read cluster config {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("parse cluster config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).context("parse cluster document")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.servers.is_empty(), "cluster needs at least one server");
        let mut ids: Vec<_> = self.servers.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids.dedup();
        ensure!(
            ids.len() == self.servers.len(),
            "cluster server ids must be unique"
        );
        Ok(())
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.iter().map(|s| s.id).collect()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.servers.iter().any(|s| s.id == id)
    }

    pub fn addr_of(&self, id: ServerId) -> Option<String> {
        self.servers.iter().find(|s| s.id == id).map(|s| s.addr())
    }

    /// Strictly more than half the cluster.
    pub fn majority(&self) -> usize {
        self.servers.len() / 2 + 1
    }
}

/// Consensus timers. The heartbeat must fire strictly more often than the
/// shortest election timeout, and election timeouts are drawn fresh from
/// the configured interval on every reset so that colliding candidates
/// diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
        }
    }
}

impl TimingConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat interval must be shorter than the minimum election timeout"
        );
        ensure!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout interval is inverted"
        );
        Ok(())
    }
}

/// Everything needed to spawn one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: ServerId,
    pub cluster: ClusterConfig,
    /// Name of this node's durable state store.
    pub storage_name: String,
    pub timing: TimingConfig,
}
