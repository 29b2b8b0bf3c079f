//! # error
//!
//! why: give callers of a running node one error type to match on
//! relations: wraps raft_core::RaftError; TransportError comes out of transport.rs and tcp.rs
//! what: NodeError, TransportError

use std::io;

use raft_core::{LogIndex, NodeId, RaftError};
use thiserror::Error;

/// Why an RPC to a peer produced no response this round.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(NodeId),

    #[error("no address configured for peer {0}")]
    UnknownPeer(NodeId),

    #[error("rpc timed out")]
    Timeout,

    #[error("peer {peer} answered with an unexpected frame: {message}")]
    Protocol { peer: NodeId, message: String },

    #[error("transport i/o: {0}")]
    Io(#[from] io::Error),
}

/// Errors returned through a [`crate::NodeHandle`].
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Raft(#[from] RaftError),

    /// The node task has exited (shutdown or fatal storage error).
    #[error("node has stopped")]
    Stopped,

    /// The proposal's slot was taken by another leader's entry.
    #[error("proposal at index {index} was superseded by another leader")]
    ProposalDropped { index: LogIndex },

    /// Leadership moved on before the entry committed. It may still commit
    /// under the new leader, so the outcome is unknown.
    #[error("lost leadership before index {index} committed")]
    LeadershipLost {
        index: LogIndex,
        leader: Option<NodeId>,
    },

    #[error("invalid node configuration: {0}")]
    Config(String),
}

impl NodeError {
    /// Leader to retry against, when the error says this node is not it.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            NodeError::Raft(RaftError::NotLeader { leader })
            | NodeError::LeadershipLost { leader, .. } => *leader,
            _ => None,
        }
    }

    pub fn is_not_leader(&self) -> bool {
        matches!(self, NodeError::Raft(RaftError::NotLeader { .. }))
    }
}
