//! # transport
//!
//! why: decouple the runtime from how RPCs reach peers
//! relations: runtime.rs calls Transport; tcp.rs implements it over sockets
//! what: Transport trait, LocalNetwork/LocalTransport for in-process clusters with fault injection

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use raft_core::{AppendEntriesRequest, AppendEntriesResponse, NodeId, VoteRequest, VoteResponse};
use tracing::info;

use crate::error::TransportError;
use crate::runtime::NodeHandle;

/// Delivers the two Raft RPCs to a peer and waits for the reply.
///
/// Implementations need not enforce a deadline; the runtime wraps every
/// call in its own rpc timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError>;

    async fn send_append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError>;
}

#[derive(Default)]
struct NetworkState {
    nodes: BTreeMap<NodeId, NodeHandle>,
    /// directed links currently dropping traffic
    cut: BTreeSet<(NodeId, NodeId)>,
}

/// An in-process network of running nodes.
///
/// Links can be cut and restored at runtime, which is how tests partition
/// a cluster.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport for node `id` to reach the others.
    pub fn transport(&self, id: NodeId) -> LocalTransport {
        LocalTransport {
            id,
            network: self.clone(),
        }
    }

    pub fn register(&self, handle: NodeHandle) {
        self.state().nodes.insert(handle.id(), handle);
    }

    /// Cut every link to and from `id`.
    pub fn isolate(&self, id: NodeId) {
        let mut state = self.state();
        let others: Vec<NodeId> = state.nodes.keys().copied().filter(|&n| n != id).collect();
        for other in others {
            state.cut.insert((id, other));
            state.cut.insert((other, id));
        }
        info!(node = id, "isolated node");
    }

    /// Split the registered nodes into groups that cannot reach each other.
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut state = self.state();
        for (i, a) in groups.iter().enumerate() {
            for b in &groups[i + 1..] {
                for &x in a.iter() {
                    for &y in b.iter() {
                        state.cut.insert((x, y));
                        state.cut.insert((y, x));
                    }
                }
            }
        }
        info!(?groups, "partitioned network");
    }

    pub fn heal(&self) {
        self.state().cut.clear();
        info!("healed network");
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<NodeHandle, TransportError> {
        let state = self.state();
        if state.cut.contains(&(from, to)) {
            return Err(TransportError::Unreachable(to));
        }
        state
            .nodes
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownPeer(to))
    }

    /// The reply leg is checked separately so one-way cuts behave.
    fn reply_path(&self, from: NodeId, to: NodeId) -> Result<(), TransportError> {
        if self.state().cut.contains(&(to, from)) {
            return Err(TransportError::Unreachable(to));
        }
        Ok(())
    }
}

/// One node's view of a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalTransport {
    id: NodeId,
    network: LocalNetwork,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        let target = self.network.route(self.id, peer)?;
        let resp = target
            .request_vote(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        self.network.reply_path(self.id, peer)?;
        Ok(resp)
    }

    async fn send_append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        let target = self.network.route(self.id, peer)?;
        let resp = target
            .append_entries(req)
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        self.network.reply_path(self.id, peer)?;
        Ok(resp)
    }
}
