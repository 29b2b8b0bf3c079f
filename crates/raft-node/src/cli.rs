//! # cli
//!
//! why: one binary runs a member and talks to a running cluster
//! relations: parsed by main.rs; run reads config.rs, propose/status go through tcp.rs
//! what: Cli, Command, RunArgs, ProposeArgs, StatusArgs

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cluster member until ctrl-c.
    Run(RunArgs),
    /// Replicate a key-value write through a running cluster.
    Propose(ProposeArgs),
    /// Print a node's role, term and indexes.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// JSON node config (id, listen_addr, peers, data_dir).
    #[arg(long)]
    pub config: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct ProposeArgs {
    /// Any member; followers answer with the current leader.
    #[arg(long, default_value = "127.0.0.1:7101")]
    pub addr: String,

    #[arg(long)]
    pub key: String,

    /// Value to store. Omit together with --delete to remove the key.
    #[arg(long, required_unless_present = "delete")]
    pub value: Option<String>,

    #[arg(long, conflicts_with = "value")]
    pub delete: bool,

    /// Give up after this long, waiting for commit included.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "127.0.0.1:7101")]
    pub addr: String,

    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
}
