//! # runtime
//!
//! why: a RaftNode does no I/O; something has to own it, keep time and talk to peers
//! relations: drives raft_core::RaftNode + Applier, sends through a Transport, served by tcp.rs
//! what: spawn_node, NodeHandle, RuntimeOptions, ProposeOutcome, the per-node event loop
//!
//! Each node is a single tokio task that owns its `RaftNode` and `Applier`.
//! Everything that touches consensus state funnels through one `select!`
//! loop: inbound RPCs and client commands arrive on an mpsc channel, peer
//! replies on another, and a ticker drives election and heartbeat timers.
//! Outbound RPCs run as separate tasks so the loop never waits on the
//! network.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, Applier, ApplyReport, Envelope, LogIndex,
    NodeId, NodeStatus, RaftError, RaftMessage, RaftNode, RaftResult, Role, StateMachine, Storage,
    Term, VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{NodeError, TransportError};
use crate::transport::Transport;

const COMMAND_QUEUE: usize = 1024;

/// Timer and network knobs for the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// How often `RaftNode::tick` runs; bounds timer precision
    pub tick_interval: Duration,
    /// Deadline for a single peer RPC
    pub rpc_timeout: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            rpc_timeout: Duration::from_millis(100),
        }
    }
}

/// A committed and applied proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeOutcome {
    pub index: LogIndex,
    pub term: Term,
    /// Whatever the state machine returned for this entry
    pub output: Vec<u8>,
}

enum Command {
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<ProposeOutcome, NodeError>>,
    },
    RequestVote {
        req: VoteRequest,
        reply: oneshot::Sender<Result<VoteResponse, NodeError>>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesResponse, NodeError>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum PeerReply {
    Vote {
        peer: NodeId,
        result: Result<VoteResponse, TransportError>,
    },
    Append {
        peer: NodeId,
        result: Result<AppendEntriesResponse, TransportError>,
    },
}

/// A proposal waiting for its entry to be applied.
struct Pending {
    term: Term,
    reply: oneshot::Sender<Result<ProposeOutcome, NodeError>>,
}

/// Cheap, cloneable handle to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    tx: mpsc::Sender<Command>,
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Replicate `command` and wait until this node has applied it.
    ///
    /// A follower or candidate rejects straight away with
    /// `RaftError::NotLeader`, carrying the last leader it heard from.
    /// If this node stops leading before the entry commits, the call ends
    /// with `NodeError::LeadershipLost`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<ProposeOutcome, NodeError> {
        self.call(|reply| Command::Propose { command, reply }).await?
    }

    /// Deliver a RequestVote RPC from a peer.
    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse, NodeError> {
        self.call(|reply| Command::RequestVote { req, reply }).await?
    }

    /// Deliver an AppendEntries RPC from a peer.
    pub async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, NodeError> {
        self.call(|reply| Command::AppendEntries { req, reply }).await?
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.call(|reply| Command::Status { reply }).await
    }

    /// Stop the node and wait for its task to release storage.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.call(|done| Command::Shutdown { done }).await
    }
}

/// Start `node` on the current tokio runtime.
pub fn spawn_node<S, M, T>(
    node: RaftNode<S>,
    applier: Applier<M>,
    transport: Arc<T>,
    options: RuntimeOptions,
) -> NodeHandle
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
    T: Transport + 'static,
{
    let id = node.id();
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let (replies_tx, replies_rx) = mpsc::unbounded_channel();

    let worker = Worker {
        node,
        applier,
        transport,
        options,
        replies_tx,
        in_flight: BTreeSet::new(),
        unreachable: BTreeSet::new(),
        pending: BTreeMap::new(),
    };
    tokio::spawn(async move {
        let done = worker.run(rx, replies_rx).await;
        if let Some(done) = done {
            let _ = done.send(());
        }
    });

    info!(node = id, "node started");
    NodeHandle { id, tx }
}

struct Worker<S, M, T> {
    node: RaftNode<S>,
    applier: Applier<M>,
    transport: Arc<T>,
    options: RuntimeOptions,
    replies_tx: mpsc::UnboundedSender<PeerReply>,
    /// peers with an RPC outstanding; at most one each
    in_flight: BTreeSet<NodeId>,
    /// peers whose last RPC failed, so failures are only warned about once
    unreachable: BTreeSet<NodeId>,
    pending: BTreeMap<LogIndex, Pending>,
}

impl<S, M, T> Worker<S, M, T>
where
    S: Storage + Send + 'static,
    M: StateMachine + Send + 'static,
    T: Transport + 'static,
{
    /// Runs until shutdown or a fatal error; hands back the shutdown ack.
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut replies: mpsc::UnboundedReceiver<PeerReply>,
    ) -> Option<oneshot::Sender<()>> {
        let mut ticker = time::interval(self.options.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let id = self.node.id();

        let done = loop {
            let result = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { done }) => break Some(done),
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                Some(reply) = replies.recv() => self.handle_peer_reply(reply),
                _ = ticker.tick() => self.node.tick(),
            };

            if let Err(err) = result {
                if err.is_fatal() {
                    error!(node = id, error = %err, "fatal error, stopping node");
                    break None;
                }
                warn!(node = id, error = %err, "event failed");
            }
            self.after_event();
        };

        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(NodeError::Stopped));
        }
        info!(node = id, "node stopped");
        done
    }

    fn handle_command(&mut self, command: Command) -> RaftResult<()> {
        match command {
            Command::Propose { command, reply } => match self.node.propose(command) {
                Ok(entry) => {
                    self.pending.insert(
                        entry.index,
                        Pending {
                            term: entry.term,
                            reply,
                        },
                    );
                    Ok(())
                }
                Err(err) if err.is_fatal() => {
                    let _ = reply.send(Err(NodeError::Stopped));
                    Err(err)
                }
                Err(err) => {
                    let _ = reply.send(Err(err.into()));
                    Ok(())
                }
            },
            Command::RequestVote { req, reply } => {
                let resp = self.node.handle_vote_request(req);
                respond(reply, resp)
            }
            Command::AppendEntries { req, reply } => {
                let resp = self.node.handle_append_entries(req);
                respond(reply, resp)
            }
            Command::Status { reply } => {
                let _ = reply.send(self.node.status());
                Ok(())
            }
            // handled by the loop
            Command::Shutdown { done } => {
                let _ = done.send(());
                Ok(())
            }
        }
    }

    fn handle_peer_reply(&mut self, reply: PeerReply) -> RaftResult<()> {
        match reply {
            PeerReply::Vote { peer, result } => {
                self.in_flight.remove(&peer);
                if let Some(resp) = self.note_reachability(peer, result) {
                    self.node.handle_vote_response(peer, resp)?;
                }
            }
            PeerReply::Append { peer, result } => {
                self.in_flight.remove(&peer);
                if let Some(resp) = self.note_reachability(peer, result) {
                    self.node.handle_append_entries_response(peer, resp)?;
                }
            }
        }
        Ok(())
    }

    /// A failed RPC just withholds that peer's vote or ack this round.
    fn note_reachability<R>(&mut self, peer: NodeId, result: Result<R, TransportError>) -> Option<R> {
        let id = self.node.id();
        match result {
            Ok(resp) => {
                if self.unreachable.remove(&peer) {
                    info!(node = id, peer, "peer reachable again");
                }
                Some(resp)
            }
            Err(err) => {
                let err = match err {
                    TransportError::Timeout => RaftError::Timeout { peer }.to_string(),
                    other => other.to_string(),
                };
                if self.unreachable.insert(peer) {
                    warn!(node = id, peer, error = %err, "peer rpc failed");
                } else {
                    debug!(node = id, peer, error = %err, "peer rpc failed again");
                }
                None
            }
        }
    }

    /// Send what the node queued, apply what it committed, settle proposals.
    fn after_event(&mut self) {
        for envelope in self.node.take_messages() {
            self.dispatch(envelope);
        }

        let reports = self.applier.apply_committed(&mut self.node);
        for report in reports {
            self.complete(report);
        }

        // proposals whose slot now holds another leader's entry
        let node = &self.node;
        let superseded: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(&index, p)| node.log().term_at(index) != Some(p.term))
            .map(|(&index, _)| index)
            .collect();
        for index in superseded {
            if let Some(pending) = self.pending.remove(&index) {
                debug!(node = self.node.id(), index, "proposal superseded");
                let _ = pending.reply.send(Err(NodeError::ProposalDropped { index }));
            }
        }

        // still in the log, but nobody here will drive it to commit
        let leading = self.node.role() == Role::Leader;
        let term = self.node.current_term();
        let orphaned: Vec<LogIndex> = self
            .pending
            .iter()
            .filter(|(_, p)| !leading || p.term != term)
            .map(|(&index, _)| index)
            .collect();
        let leader = self.node.leader_id();
        for index in orphaned {
            if let Some(pending) = self.pending.remove(&index) {
                debug!(node = self.node.id(), index, term, ?leader, "proposal orphaned by step-down");
                let _ = pending.reply.send(Err(NodeError::LeadershipLost { index, leader }));
            }
        }
    }

    fn complete(&mut self, report: ApplyReport) {
        let Some(pending) = self.pending.remove(&report.index) else {
            return;
        };
        let result = if pending.term == report.term {
            Ok(ProposeOutcome {
                index: report.index,
                term: report.term,
                output: report.output,
            })
        } else {
            Err(NodeError::ProposalDropped {
                index: report.index,
            })
        };
        let _ = pending.reply.send(result);
    }

    fn dispatch(&mut self, Envelope { to, message }: Envelope) {
        // the core re-sends on the next heartbeat or reply
        if !self.in_flight.insert(to) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        let replies = self.replies_tx.clone();
        let deadline = self.options.rpc_timeout;

        match message {
            RaftMessage::VoteRequest(req) => {
                tokio::spawn(async move {
                    let result = time::timeout(deadline, transport.send_request_vote(to, req))
                        .await
                        .unwrap_or(Err(TransportError::Timeout));
                    let _ = replies.send(PeerReply::Vote { peer: to, result });
                });
            }
            RaftMessage::AppendEntries(req) => {
                tokio::spawn(async move {
                    let result = time::timeout(deadline, transport.send_append_entries(to, req))
                        .await
                        .unwrap_or(Err(TransportError::Timeout));
                    let _ = replies.send(PeerReply::Append { peer: to, result });
                });
            }
            RaftMessage::VoteResponse(_) | RaftMessage::AppendEntriesResponse(_) => {
                // responses travel back on the request's own channel
                self.in_flight.remove(&to);
            }
        }
    }
}

/// Answer an inbound RPC. A fatal error still stops the node after replying.
fn respond<R>(reply: oneshot::Sender<Result<R, NodeError>>, result: RaftResult<R>) -> RaftResult<()> {
    match result {
        Ok(resp) => {
            let _ = reply.send(Ok(resp));
            Ok(())
        }
        Err(err) if err.is_fatal() => {
            let _ = reply.send(Err(NodeError::Stopped));
            Err(err)
        }
        Err(err) => {
            let _ = reply.send(Err(err.into()));
            Ok(())
        }
    }
}
