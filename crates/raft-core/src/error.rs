//! # error
//!
//! why: give every rejection path in the protocol a name the caller can match on
//! relations: returned by node.rs, log.rs and applier.rs; wrapped by raft-node
//! what: RaftError, RaftResult

use std::io;

use thiserror::Error;

use crate::{LogIndex, NodeId, Term};

/// Errors produced by the consensus core.
///
/// Everything except [`RaftError::Storage`] and [`RaftError::LogGap`] is
/// recoverable by protocol retry. Those two mean a vote or log entry may not
/// have reached disk, so the node must stop participating.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Incoming RPC carries a term lower than ours
    #[error("stale term {term}: local term is {current}")]
    StaleTerm { term: Term, current: Term },

    /// prevLogIndex/prevLogTerm check failed on AppendEntries
    #[error("log mismatch: no entry at index {index} with term {term}")]
    LogMismatch { index: LogIndex, term: Term },

    /// propose() called on a follower or candidate
    #[error("not leader: last known leader is {leader:?}")]
    NotLeader { leader: Option<NodeId> },

    /// No response from a peer within the round
    #[error("peer {peer} did not respond in time")]
    Timeout { peer: NodeId },

    /// Appended or restored entries are not contiguous
    #[error("log gap: expected index {expected}, got {got}")]
    LogGap { expected: LogIndex, got: LogIndex },

    /// Durable storage could not persist term, vote or log
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl RaftError {
    /// Whether the node must stop participating after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RaftError::Storage(_) | RaftError::LogGap { .. })
    }
}

pub type RaftResult<T> = Result<T, RaftError>;
