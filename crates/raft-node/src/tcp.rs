//! # tcp
//!
//! why: let nodes in separate processes exchange rpcs and accept client proposals
//! relations: implements transport::Transport; serve() feeds a NodeHandle
//! what: newline-delimited json frames, TcpTransport, serve, client_request

use std::collections::BTreeMap;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{
    AppendEntriesRequest, AppendEntriesResponse, NodeId, NodeStatus, VoteRequest, VoteResponse,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::{NodeError, TransportError};
use crate::runtime::{NodeHandle, ProposeOutcome};
use crate::transport::Transport;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Default deadline for [`client_request`], waiting for commit included.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a node accepts on its listen address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireRequest {
    RequestVote(VoteRequest),
    AppendEntries(AppendEntriesRequest),
    Propose { command: Vec<u8> },
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireResponse {
    Vote(VoteResponse),
    Append(AppendEntriesResponse),
    Proposed(ProposeOutcome),
    /// Proposal refused; `leader` is where to retry, if known
    NotLeader { leader: Option<NodeId> },
    Status(NodeStatus),
    Error { message: String },
}

pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(frame).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// One request, one response, on a fresh connection.
pub async fn client_request(addr: &str, request: &WireRequest) -> Result<WireResponse, TransportError> {
    client_request_within(addr, request, CLIENT_TIMEOUT).await
}

/// Like [`client_request`], giving up with `TransportError::Timeout` after `deadline`.
pub async fn client_request_within(
    addr: &str,
    request: &WireRequest,
    deadline: Duration,
) -> Result<WireResponse, TransportError> {
    time::timeout(deadline, exchange(addr, request))
        .await
        .unwrap_or(Err(TransportError::Timeout))
}

async fn exchange(addr: &str, request: &WireRequest) -> Result<WireResponse, TransportError> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    write_frame(&mut writer, request).await?;
    let mut reader = BufReader::new(reader);
    read_frame(&mut reader).await?.ok_or_else(|| {
        TransportError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before a response",
        ))
    })
}

/// Reaches peers by the addresses in the node's config.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    peers: BTreeMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(peers: BTreeMap<NodeId, String>) -> Self {
        Self { peers }
    }

    async fn call(&self, peer: NodeId, request: &WireRequest) -> Result<WireResponse, TransportError> {
        let addr = self.peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        match client_request(addr, request).await {
            Err(TransportError::Io(err)) if err.kind() == io::ErrorKind::ConnectionRefused => {
                Err(TransportError::Unreachable(peer))
            }
            other => other,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        match self.call(peer, &WireRequest::RequestVote(req)).await? {
            WireResponse::Vote(resp) => Ok(resp),
            other => Err(unexpected(peer, &other)),
        }
    }

    async fn send_append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, TransportError> {
        match self.call(peer, &WireRequest::AppendEntries(req)).await? {
            WireResponse::Append(resp) => Ok(resp),
            other => Err(unexpected(peer, &other)),
        }
    }
}

fn unexpected(peer: NodeId, frame: &WireResponse) -> TransportError {
    TransportError::Protocol {
        peer,
        message: format!("{frame:?}"),
    }
}

/// Accept peers and clients until the listener fails.
pub async fn serve(listener: TcpListener, handle: NodeHandle) -> io::Result<()> {
    info!(node = handle.id(), addr = %listener.local_addr()?, "listening");
    loop {
        let (stream, remote) = listener.accept().await?;
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(stream, &handle).await {
                debug!(node = handle.id(), %remote, error = %err, "connection closed with error");
            }
        });
    }
}

async fn serve_connection(stream: TcpStream, handle: &NodeHandle) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    while let Some(request) = read_frame::<_, WireRequest>(&mut reader).await? {
        let response = dispatch(handle, request).await;
        write_frame(&mut writer, &response).await?;
    }
    Ok(())
}

async fn dispatch(handle: &NodeHandle, request: WireRequest) -> WireResponse {
    let result = match request {
        WireRequest::RequestVote(req) => handle.request_vote(req).await.map(WireResponse::Vote),
        WireRequest::AppendEntries(req) => handle.append_entries(req).await.map(WireResponse::Append),
        WireRequest::Propose { command } => handle.propose(command).await.map(WireResponse::Proposed),
        WireRequest::Status => handle.status().await.map(WireResponse::Status),
    };
    match result {
        Ok(response) => response,
        Err(err) if err.is_not_leader() => WireResponse::NotLeader {
            leader: err.leader_hint(),
        },
        Err(err) => {
            if matches!(err, NodeError::Stopped) {
                warn!(node = handle.id(), "request arrived after node stopped");
            }
            WireResponse::Error {
                message: err.to_string(),
            }
        }
    }
}
