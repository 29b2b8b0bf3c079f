//! # config
//!
//! why: describe one cluster member in a file an operator can edit
//! relations: read by the raft-node binary; feeds RaftNode::restore and RuntimeOptions
//! what: NodeConfig (json), defaults, validation

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use raft_core::{NodeId, RaftConfig};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::runtime::RuntimeOptions;

fn default_rpc_timeout_ms() -> u64 {
    100
}

fn default_tick_interval_ms() -> u64 {
    10
}

/// Static description of a node and its cluster.
///
/// ```json
/// {
///   "id": 1,
///   "listen_addr": "127.0.0.1:7101",
///   "peers": { "1": "127.0.0.1:7101", "2": "127.0.0.1:7102", "3": "127.0.0.1:7103" },
///   "data_dir": "data/node1"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    pub listen_addr: String,
    /// Every member's address, this node included
    pub peers: BTreeMap<NodeId, String>,
    pub data_dir: PathBuf,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub raft: RaftConfig,
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, NodeError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("reading {}: {e}", path.display())))?;
        let config: NodeConfig = serde_json::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if !self.peers.contains_key(&self.id) {
            return Err(NodeError::Config(format!(
                "node {} must appear in its own peers map",
                self.id
            )));
        }
        if self.rpc_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(NodeError::Config(
                "rpc_timeout_ms and tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.tick_interval_ms >= self.raft.heartbeat_interval {
            return Err(NodeError::Config(format!(
                "tick_interval_ms ({}) must be below heartbeat_interval ({})",
                self.tick_interval_ms, self.raft.heartbeat_interval
            )));
        }
        self.raft.validate()?;
        Ok(())
    }

    /// Voting members, sorted.
    pub fn cluster(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }

    /// Addresses of everyone but this node.
    pub fn remote_peers(&self) -> BTreeMap<NodeId, String> {
        self.peers
            .iter()
            .filter(|(&id, _)| id != self.id)
            .map(|(&id, addr)| (id, addr.clone()))
            .collect()
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
        }
    }
}
