//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management, clock.rs for timers
//! what: Role enum, RaftNode struct, election/heartbeat timers, replication and commit logic
//!
//! The node does no I/O of its own besides writing to its `Storage`.
//! Requests it wants sent are queued as [`Envelope`]s and drained with
//! [`RaftNode::take_messages`]; replies to incoming requests are returned
//! directly from the handlers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::clock::{Clock, ElectionTimeouts, SystemClock};
use crate::config::RaftConfig;
use crate::error::{RaftError, RaftResult};
use crate::log::{LogEntry, RaftLog};
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, Envelope, RaftMessage, VoteRequest, VoteResponse,
};
use crate::storage::{InMemoryStorage, Storage};
use crate::{LogIndex, NodeId, Term};

/// The three possible roles a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Role {
    /// Passive state - listens for heartbeats, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

/// Per-follower replication progress, only kept while leading.
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    fn new(peers: &[NodeId], next: LogIndex) -> Self {
        Self {
            next_index: peers.iter().map(|&p| (p, next)).collect(),
            match_index: peers.iter().map(|&p| (p, 0)).collect(),
        }
    }

    /// Next log index to send to `peer`.
    pub fn next_index(&self, peer: NodeId) -> Option<LogIndex> {
        self.next_index.get(&peer).copied()
    }

    /// Highest log index known to be replicated on `peer`.
    pub fn match_index(&self, peer: NodeId) -> Option<LogIndex> {
        self.match_index.get(&peer).copied()
    }
}

/// Point-in-time view of a node, cheap to copy out of the event loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode<S = InMemoryStorage> {
    id: NodeId,
    /// Every voting member, including this node, sorted
    cluster: Vec<NodeId>,
    config: RaftConfig,

    // persisted through the log's storage
    current_term: Term,
    voted_for: Option<NodeId>,
    log: RaftLog<S>,

    // volatile
    role: Role,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    votes_received: BTreeSet<NodeId>,
    leader_state: Option<LeaderState>,

    clock: Arc<dyn Clock>,
    timeouts: ElectionTimeouts,
    election_deadline: Duration,
    heartbeat_deadline: Duration,
    outbox: Vec<Envelope>,
}

impl RaftNode<InMemoryStorage> {
    /// Create a new Raft node in Follower state with in-memory storage
    pub fn new(id: NodeId, cluster: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, cluster: Vec<NodeId>, config: RaftConfig) -> Self {
        Self::from_parts(
            id,
            cluster,
            config,
            RaftLog::in_memory(),
            (0, None),
            Arc::new(SystemClock::new()),
        )
    }
}

impl<S: Storage> RaftNode<S> {
    /// Rebuild a node from whatever `storage` holds.
    ///
    /// Term, vote and log come back exactly as persisted; commit and apply
    /// progress restart from zero and move forward again.
    pub fn restore(
        id: NodeId,
        cluster: Vec<NodeId>,
        config: RaftConfig,
        storage: S,
        clock: Arc<dyn Clock>,
    ) -> RaftResult<Self> {
        config.validate()?;
        if !cluster.contains(&id) {
            return Err(RaftError::InvalidConfig(format!(
                "node {id} is not a member of cluster {cluster:?}"
            )));
        }
        let hard_state = storage.load_term_and_vote()?;
        let log = RaftLog::open(storage)?;
        let node = Self::from_parts(id, cluster, config, log, hard_state, clock);
        info!(
            node = id,
            term = node.current_term,
            last_index = node.log.last_index(),
            "restored raft node"
        );
        Ok(node)
    }

    fn from_parts(
        id: NodeId,
        mut cluster: Vec<NodeId>,
        config: RaftConfig,
        log: RaftLog<S>,
        (current_term, voted_for): (Term, Option<NodeId>),
        clock: Arc<dyn Clock>,
    ) -> Self {
        cluster.push(id);
        cluster.sort_unstable();
        cluster.dedup();

        let mut timeouts = ElectionTimeouts::new(&config);
        let now = clock.now();
        let election_deadline = now + timeouts.next_timeout();

        Self {
            id,
            cluster,
            config,
            current_term,
            voted_for,
            log,
            role: Role::Follower,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            votes_received: BTreeSet::new(),
            leader_state: None,
            clock,
            timeouts,
            election_deadline,
            heartbeat_deadline: now,
            outbox: Vec::new(),
        }
    }

    // -- accessors --

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Last known leader for the current term (self when leading).
    pub fn leader_id(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn cluster(&self) -> &[NodeId] {
        &self.cluster
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn log(&self) -> &RaftLog<S> {
        &self.log
    }

    pub fn votes_received(&self) -> &BTreeSet<NodeId> {
        &self.votes_received
    }

    /// Replication progress; `None` unless this node is the leader.
    pub fn leader_state(&self) -> Option<&LeaderState> {
        self.leader_state.as_ref()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.cluster
            .iter()
            .copied()
            .filter(|&p| p != self.id)
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.log.last_index(),
        }
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    pub fn get_entry(&self, index: LogIndex) -> Option<&LogEntry> {
        self.log.entry_at(index)
    }

    /// Term at `index`, 0 if there is no such entry.
    pub fn get_term_at(&self, index: LogIndex) -> Term {
        self.log.term_at(index).unwrap_or(0)
    }

    // -- quorum --

    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- timers --

    /// Drive time-based transitions. Call periodically.
    ///
    /// A follower or candidate whose election deadline has passed starts a
    /// new election; a leader whose heartbeat is due sends AppendEntries to
    /// every peer.
    pub fn tick(&mut self) -> RaftResult<()> {
        let now = self.clock.now();
        match self.role {
            Role::Leader => {
                if now >= self.heartbeat_deadline {
                    self.broadcast_append_entries();
                }
            }
            Role::Follower | Role::Candidate => {
                if now >= self.election_deadline {
                    self.start_election()?;
                }
            }
        }
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        self.election_deadline = self.clock.now() + self.timeouts.next_timeout();
    }

    /// Outbound requests queued since the last call.
    pub fn take_messages(&mut self) -> Vec<Envelope> {
        std::mem::take(&mut self.outbox)
    }

    // -- persistence --

    /// Durably record term and vote, then adopt them.
    fn persist_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> RaftResult<()> {
        if let Err(err) = self.log.storage_mut().save_term_and_vote(term, voted_for) {
            error!(node = self.id, term, error = %err, "failed to persist term and vote");
            return Err(err.into());
        }
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    // -- role transitions --

    /// Step down to follower, adopting `term` if it is newer.
    pub fn become_follower(&mut self, term: Term) -> RaftResult<()> {
        if term > self.current_term {
            self.persist_term_and_vote(term, None)?;
            self.leader_id = None;
        }
        let was_leader = self.role == Role::Leader;
        if self.role != Role::Follower {
            info!(node = self.id, term = self.current_term, from = ?self.role, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.votes_received.clear();
        self.leader_state = None;
        if was_leader {
            self.reset_election_timer();
        }
        Ok(())
    }

    /// Become a candidate for the next term and ask every peer for a vote.
    ///
    /// The returned request is also queued for each peer. A single-node
    /// cluster wins on its own vote and leads immediately.
    pub fn start_election(&mut self) -> RaftResult<VoteRequest> {
        let term = self.current_term + 1;
        self.persist_term_and_vote(term, Some(self.id))?;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.leader_state = None;
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        self.reset_election_timer();

        info!(node = self.id, term, "starting election");

        let request = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        } else {
            for peer in self.peers() {
                self.outbox.push(Envelope {
                    to: peer,
                    message: RaftMessage::VoteRequest(request.clone()),
                });
            }
        }
        Ok(request)
    }

    fn become_leader(&mut self) {
        info!(node = self.id, term = self.current_term, "became leader");
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        self.leader_state = Some(LeaderState::new(&self.peers(), self.log.last_index() + 1));
        self.broadcast_append_entries();
    }

    // -- elections --

    /// Handle a RequestVote RPC. The vote is on disk before this returns.
    pub fn handle_vote_request(&mut self, req: VoteRequest) -> RaftResult<VoteResponse> {
        if req.term < self.current_term {
            let err = RaftError::StaleTerm {
                term: req.term,
                current: self.current_term,
            };
            debug!(node = self.id, candidate = req.candidate_id, %err, "rejecting vote request");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        if req.term > self.current_term {
            self.become_follower(req.term)?;
        }

        let can_vote = self.voted_for.map_or(true, |v| v == req.candidate_id);
        let log_ok = req.last_log_term > self.log.last_term()
            || (req.last_log_term == self.log.last_term()
                && req.last_log_index >= self.log.last_index());
        let granted = can_vote && log_ok;

        if granted {
            if self.voted_for != Some(req.candidate_id) {
                self.persist_term_and_vote(self.current_term, Some(req.candidate_id))?;
            }
            self.reset_election_timer();
            debug!(node = self.id, candidate = req.candidate_id, term = self.current_term, "granted vote");
        } else {
            debug!(
                node = self.id,
                candidate = req.candidate_id,
                term = self.current_term,
                already_voted = !can_vote,
                stale_log = !log_ok,
                "rejected vote"
            );
        }

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: granted,
        })
    }

    /// Fold a vote response into the election. Returns true if this node
    /// just became leader.
    pub fn handle_vote_response(&mut self, from: NodeId, resp: VoteResponse) -> RaftResult<bool> {
        if resp.term > self.current_term {
            self.become_follower(resp.term)?;
            return Ok(false);
        }
        // responses from an earlier election or after we moved on
        if self.role != Role::Candidate || resp.term < self.current_term {
            return Ok(false);
        }
        if !resp.vote_granted || !self.cluster.contains(&from) {
            return Ok(false);
        }

        self.votes_received.insert(from);
        if self.has_quorum() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    // -- replication (leader side) --

    /// Append a client command to the leader's log and start replicating it.
    ///
    /// Followers and candidates reject with the last known leader as a hint.
    pub fn propose(&mut self, command: Vec<u8>) -> RaftResult<LogEntry> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader: self.leader_id,
            });
        }

        let entry = LogEntry::new(self.current_term, self.log.last_index() + 1, command);
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(node = self.id, index = entry.index, term = entry.term, "appended proposal");

        // a lone node is its own majority
        self.advance_commit_index();
        for peer in self.peers() {
            if let Some(req) = self.create_append_entries(peer) {
                self.outbox.push(Envelope {
                    to: peer,
                    message: RaftMessage::AppendEntries(req),
                });
            }
        }
        Ok(entry)
    }

    /// AppendEntries for `peer` starting at its next index. Empty when the
    /// peer is caught up, which makes it a heartbeat.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        if self.role != Role::Leader {
            return None;
        }
        let next = self.leader_state.as_ref()?.next_index(peer)?;
        let next = next.clamp(1, self.log.last_index() + 1);
        let prev_log_index = next - 1;

        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, self.config.max_entries_per_append),
            leader_commit: self.commit_index,
        })
    }

    fn broadcast_append_entries(&mut self) {
        for peer in self.peers() {
            if let Some(req) = self.create_append_entries(peer) {
                self.outbox.push(Envelope {
                    to: peer,
                    message: RaftMessage::AppendEntries(req),
                });
            }
        }
        self.heartbeat_deadline =
            self.clock.now() + Duration::from_millis(self.config.heartbeat_interval);
    }

    /// Fold an AppendEntries response into replication progress. Returns
    /// true if the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        from: NodeId,
        resp: AppendEntriesResponse,
    ) -> RaftResult<bool> {
        if resp.term > self.current_term {
            self.become_follower(resp.term)?;
            return Ok(false);
        }
        if self.role != Role::Leader || resp.term < self.current_term {
            return Ok(false);
        }
        let last_index = self.log.last_index();
        let Some(state) = self.leader_state.as_mut() else {
            return Ok(false);
        };
        let (Some(&next), Some(&matched)) = (state.next_index.get(&from), state.match_index.get(&from))
        else {
            return Ok(false);
        };

        let mut advanced = false;
        if resp.success {
            let new_match = resp.match_index.min(last_index).max(matched);
            state.match_index.insert(from, new_match);
            state.next_index.insert(from, next.max(new_match + 1));
            advanced = self.advance_commit_index();
            if new_match < last_index {
                self.queue_append_entries(from);
            }
        } else {
            // back off, but never below what the peer already matched
            let backed_off = next.saturating_sub(1).min(resp.match_index + 1);
            let new_next = backed_off.max(matched + 1).max(1);
            debug!(node = self.id, peer = from, next = new_next, "follower rejected append, backing off");
            state.next_index.insert(from, new_next);
            self.queue_append_entries(from);
        }
        Ok(advanced)
    }

    fn queue_append_entries(&mut self, peer: NodeId) {
        if let Some(req) = self.create_append_entries(peer) {
            self.outbox.push(Envelope {
                to: peer,
                message: RaftMessage::AppendEntries(req),
            });
        }
    }

    /// Commit the highest current-term index stored on a majority.
    ///
    /// Entries from earlier terms are never counted directly; they commit
    /// when a later current-term entry does.
    fn advance_commit_index(&mut self) -> bool {
        if self.role != Role::Leader {
            return false;
        }
        let Some(state) = self.leader_state.as_ref() else {
            return false;
        };
        let quorum = self.quorum_size();

        let mut new_commit = self.commit_index;
        for n in (self.commit_index + 1..=self.log.last_index()).rev() {
            if self.log.term_at(n) != Some(self.current_term) {
                // terms only decrease further down the log
                break;
            }
            let replicas = 1 + state.match_index.values().filter(|&&m| m >= n).count();
            if replicas >= quorum {
                new_commit = n;
                break;
            }
        }

        if new_commit > self.commit_index {
            debug!(node = self.id, from = self.commit_index, to = new_commit, "commit index advanced");
            self.commit_index = new_commit;
            return true;
        }
        false
    }

    // -- replication (follower side) --

    /// Handle an AppendEntries RPC. New entries are on disk before this returns.
    pub fn handle_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        if req.term < self.current_term {
            let err = RaftError::StaleTerm {
                term: req.term,
                current: self.current_term,
            };
            debug!(node = self.id, leader = req.leader_id, %err, "rejecting append entries");
            return Ok(self.append_response(false, self.log.last_index()));
        }

        if req.term > self.current_term || self.role != Role::Follower {
            self.become_follower(req.term)?;
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_timer();

        if let Err(err) = self.check_append(&req) {
            debug!(node = self.id, leader = req.leader_id, %err, "rejecting append entries");
            let hint = self.log.last_index().min(req.prev_log_index.saturating_sub(1));
            return Ok(self.append_response(false, hint));
        }

        // skip entries we already hold, truncate at the first conflict
        let mut first_new = None;
        for (i, entry) in req.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.log.truncate_from(entry.index)?;
                    first_new = Some(i);
                    break;
                }
                None => {
                    first_new = Some(i);
                    break;
                }
            }
        }
        if let Some(i) = first_new {
            self.log.append(&req.entries[i..])?;
        }

        let last_new = req.last_index();
        if req.leader_commit > self.commit_index {
            let commit = req.leader_commit.min(last_new);
            if commit > self.commit_index {
                self.commit_index = commit;
            }
        }

        Ok(self.append_response(true, last_new))
    }

    /// Log-matching and sanity checks on an AppendEntries from the current leader.
    fn check_append(&self, req: &AppendEntriesRequest) -> RaftResult<()> {
        if !self.log.matches(req.prev_log_index, req.prev_log_term) {
            return Err(RaftError::LogMismatch {
                index: req.prev_log_index,
                term: req.prev_log_term,
            });
        }
        for (i, entry) in req.entries.iter().enumerate() {
            let expected = req.prev_log_index + 1 + i as LogIndex;
            if entry.index != expected {
                return Err(RaftError::LogGap {
                    expected,
                    got: entry.index,
                });
            }
            // a committed entry is never overwritten
            if entry.index <= self.commit_index && self.log.term_at(entry.index) != Some(entry.term) {
                error!(node = self.id, index = entry.index, "leader tried to overwrite a committed entry");
                return Err(RaftError::LogMismatch {
                    index: entry.index,
                    term: entry.term,
                });
            }
        }
        Ok(())
    }

    fn append_response(&self, success: bool, match_index: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
        }
    }

    // -- applying --

    /// Committed entries not yet handed out, in log order. Marks them applied.
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        if self.last_applied >= self.commit_index {
            return Vec::new();
        }
        let entries = self.log.slice(self.last_applied, self.commit_index).to_vec();
        self.last_applied = self.commit_index;
        entries
    }
}
