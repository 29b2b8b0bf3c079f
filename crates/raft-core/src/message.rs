//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-node transports
//! what: VoteRequest/Response, AppendEntriesRequest/Response, RaftMessage, Envelope

use serde::{Deserialize, Serialize};

use crate::log::LogEntry;
use crate::{LogIndex, NodeId, Term};

/// Request a vote during leader election
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// Response to a vote request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// Replicate log entries (also serves as heartbeat when entries is empty)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the last entry this request covers.
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }
}

/// Response to AppendEntries
///
/// On success `match_index` is the last index now known to match the
/// leader. On rejection it is the responder's last log index, a hint for
/// how far back the leader needs to go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RaftMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl RaftMessage {
    /// The sender's term, carried by every message kind.
    pub fn term(&self) -> Term {
        match self {
            RaftMessage::VoteRequest(m) => m.term,
            RaftMessage::VoteResponse(m) => m.term,
            RaftMessage::AppendEntries(m) => m.term,
            RaftMessage::AppendEntriesResponse(m) => m.term,
        }
    }
}

/// An outbound request addressed to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub to: NodeId,
    pub message: RaftMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_tagged() {
        let msg = RaftMessage::VoteResponse(VoteResponse {
            term: 3,
            vote_granted: true,
        });

        let json = serde_json::to_string(&msg).unwrap();

        assert_eq!(json, r#"{"type":"vote_response","term":3,"vote_granted":true}"#);
    }

    #[test]
    fn append_request_reports_last_covered_index() {
        let req = AppendEntriesRequest {
            term: 2,
            leader_id: 1,
            prev_log_index: 4,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 5, vec![]), LogEntry::new(2, 6, vec![])],
            leader_commit: 4,
        };
        assert_eq!(req.last_index(), 6);
        assert_eq!(RaftMessage::AppendEntries(req).term(), 2);
    }
}
