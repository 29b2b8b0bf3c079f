//! # raft-node binary
//!
//! why: run a cluster member from a config file, or poke a running one
//! relations: wires FileStorage, RaftNode, KvStore, TcpTransport and serve() together
//! what: init_tracing, run, propose, status

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use raft_core::{Applier, RaftNode, SystemClock};
use raft_node::{
    cli::{Cli, Command, ProposeArgs, RunArgs, StatusArgs},
    client_request_within, serve, spawn_node, KvCommand, KvStore, NodeConfig, TcpTransport,
    WireRequest, WireResponse,
};
use raft_storage::FileStorage;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await?,
        Command::Propose(args) => propose(args).await?,
        Command::Status(args) => status(args).await?,
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<()> {
    let config = NodeConfig::from_file(&args.config)?;
    let storage = FileStorage::new(&config.data_dir)
        .with_context(|| format!("opening data dir {}", config.data_dir.display()))?;
    let node = RaftNode::restore(
        config.id,
        config.cluster(),
        config.raft.clone(),
        storage,
        Arc::new(SystemClock::new()),
    )
    .context("restoring node state")?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let transport = Arc::new(TcpTransport::new(config.remote_peers()));
    let handle = spawn_node(
        node,
        Applier::new(KvStore::new()),
        transport,
        config.runtime_options(),
    );

    tokio::select! {
        result = serve(listener, handle.clone()) => {
            if let Err(err) = result {
                warn!("listener failed: {err}");
                let _ = handle.shutdown().await;
                return Err(err.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!(node = config.id, "ctrl-c received, shutting down");
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn propose(args: ProposeArgs) -> Result<()> {
    let command = match (args.delete, args.value) {
        (true, _) => KvCommand::Delete { key: args.key },
        (false, Some(value)) => KvCommand::Set { key: args.key, value },
        (false, None) => bail!("--value is required unless --delete is given"),
    };
    let request = WireRequest::Propose {
        command: command.encode()?,
    };

    let deadline = Duration::from_millis(args.timeout_ms);
    match client_request_within(&args.addr, &request, deadline).await? {
        WireResponse::Proposed(outcome) => {
            let previous = String::from_utf8_lossy(&outcome.output);
            println!(
                "committed at index {} (term {}), previous value {previous}",
                outcome.index, outcome.term
            );
        }
        WireResponse::NotLeader { leader: Some(leader) } => {
            bail!("{} is not the leader; try node {leader}", args.addr)
        }
        WireResponse::NotLeader { leader: None } => {
            bail!("{} is not the leader and knows no leader yet", args.addr)
        }
        WireResponse::Error { message } => bail!("proposal failed: {message}"),
        other => bail!("unexpected response: {other:?}"),
    }
    Ok(())
}

async fn status(args: StatusArgs) -> Result<()> {
    let deadline = Duration::from_millis(args.timeout_ms);
    match client_request_within(&args.addr, &WireRequest::Status, deadline).await? {
        WireResponse::Status(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        WireResponse::Error { message } => bail!("status failed: {message}"),
        other => bail!("unexpected response: {other:?}"),
    }
    Ok(())
}
