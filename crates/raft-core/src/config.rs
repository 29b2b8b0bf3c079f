//! # config
//!
//! why: timing and batching knobs shared by every node in a cluster
//! relations: consumed by node.rs and clock.rs, embedded in raft-node's NodeConfig
//! what: RaftConfig with defaults and validation

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, RaftResult};

/// Timing configuration for a Raft node. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout (inclusive)
    pub election_timeout_max: u64,
    /// How often a leader sends AppendEntries to every peer
    pub heartbeat_interval: u64,
    /// Cap on entries carried by a single AppendEntries
    pub max_entries_per_append: usize,
    /// Seed for the election-timeout rng; `None` seeds from entropy
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            max_entries_per_append: 64,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    /// Reject configurations where heartbeats could not keep followers quiet.
    pub fn validate(&self) -> RaftResult<()> {
        if self.heartbeat_interval == 0 {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election_timeout_min ({}) exceeds election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::InvalidConfig(
                "max_entries_per_append must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
