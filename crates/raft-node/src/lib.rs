//! # raft-node
//!
//! why: run a raft-core node as a live service with timers, peers and clients
//! relations: owns a RaftNode + Applier per task, persists through raft-storage
//! what: async runtime, transports (in-process and tcp), node config, kv state machine, cli

pub mod cli;
pub mod config;
pub mod error;
pub mod kv;
pub mod runtime;
pub mod tcp;
pub mod transport;

pub use config::NodeConfig;
pub use error::{NodeError, TransportError};
pub use kv::{KvCommand, KvStore};
pub use runtime::{spawn_node, NodeHandle, ProposeOutcome, RuntimeOptions};
pub use tcp::{
    client_request, client_request_within, serve, TcpTransport, WireRequest, WireResponse,
    CLIENT_TIMEOUT,
};
pub use transport::{LocalNetwork, LocalTransport, Transport};
