//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: persisted via raft-storage, driven over the network by raft-node
//! what: state machine, election logic, log management, message types, applier

pub mod applier;
pub mod clock;
pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod storage;

/// Election epoch
pub type Term = u64;
/// 1-based position in the replicated log; 0 means "before the first entry"
pub type LogIndex = u64;
pub type NodeId = u64;

pub use applier::{Applier, ApplyReport, StateMachine};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RaftConfig;
pub use error::{RaftError, RaftResult};
pub use log::{LogEntry, RaftLog};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, VoteRequest, VoteResponse,
};
pub use node::{LeaderState, NodeStatus, RaftNode, Role};
pub use storage::{InMemoryStorage, Storage};
