//! taskvault server binary.
//!
//! `taskvault agent --server ...` runs one cluster node: gossip
//! membership, the raft-replicated key-value state machine, and the
//! multiplexed gRPC/raft endpoint.

mod agent;
mod command;
mod config;
mod error;
mod fsm;
mod kv_service;
mod membership;
mod metrics;
mod raft;
mod reconcile;
mod store;
mod transport;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use tokio::signal;

use crate::agent::Agent;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "taskvault", version, about = "replicated key-value store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a cluster agent.
    Agent(AgentArgs),
}

#[derive(Args)]
struct AgentArgs {
    /// Enable the server role (required).
    #[arg(long)]
    server: bool,
    #[arg(long)]
    node_name: Option<String>,
    /// Gossip bind address, host:port.
    #[arg(long)]
    bind_addr: Option<String>,
    /// Address advertised to the rest of the cluster.
    #[arg(long)]
    advertise_addr: Option<String>,
    /// Multiplexed gRPC + raft port.
    #[arg(long)]
    rpc_port: Option<u16>,
    #[arg(long)]
    advertise_rpc_port: Option<u16>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// In-memory stores; for tests and single-process demos.
    #[arg(long)]
    dev: bool,
    /// Servers expected before the cluster bootstraps; 1 bootstraps
    /// immediately.
    #[arg(long)]
    bootstrap_expect: Option<u32>,
    /// Seed address to keep retrying until one answers (repeatable).
    #[arg(long = "retry-join")]
    retry_join: Vec<String>,
    /// Seed address tried once at startup (repeatable).
    #[arg(long = "start-join")]
    start_join: Vec<String>,
    /// Base64 gossip encryption key.
    #[arg(long)]
    encrypt: Option<String>,
    /// Gossip timing profile: lan, wan, or local.
    #[arg(long)]
    profile: Option<String>,
    /// How long failed members linger before being reaped.
    #[arg(long)]
    serf_reconnect_timeout: Option<String>,
    /// Interval between reconciliation sweeps on the leader.
    #[arg(long)]
    refresh_interval: Option<String>,
    /// Configured-server count below which a leader skips re-adding
    /// itself.
    #[arg(long)]
    self_join_threshold: Option<usize>,
    /// Multiplier on the raft election and heartbeat timeouts.
    #[arg(long)]
    raft_multiplier: Option<usize>,
    /// debug, info, warn, or error.
    #[arg(long)]
    log_level: Option<String>,
    #[arg(long)]
    metrics_addr: Option<String>,
    /// Extra gossip tag (repeatable).
    #[arg(long = "tag", value_parser = config::parse_key_val)]
    tags: Vec<(String, String)>,
    /// Optional TOML file; flags override its values.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

impl AgentArgs {
    fn into_config(self) -> crate::error::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.server |= self.server;
        config.dev_mode |= self.dev;
        if let Some(v) = self.node_name {
            config.node_name = v;
        }
        if let Some(v) = self.bind_addr {
            config.bind_addr = v;
        }
        if let Some(v) = self.advertise_addr {
            config.advertise_addr = v;
        }
        if let Some(v) = self.rpc_port {
            config.rpc_port = v;
        }
        if let Some(v) = self.advertise_rpc_port {
            config.advertise_rpc_port = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = v;
        }
        if let Some(v) = self.bootstrap_expect {
            config.bootstrap_expect = v;
        }
        if !self.retry_join.is_empty() {
            config.retry_join = self.retry_join;
        }
        if !self.start_join.is_empty() {
            config.start_join = self.start_join;
        }
        if let Some(v) = self.encrypt {
            config.encrypt_key = v;
        }
        if let Some(v) = self.profile {
            config.profile = v;
        }
        if let Some(v) = self.serf_reconnect_timeout {
            config.serf_reconnect_timeout = v;
        }
        if let Some(v) = self.refresh_interval {
            config.refresh_interval = v;
        }
        if let Some(v) = self.self_join_threshold {
            config.self_join_threshold = v;
        }
        if let Some(v) = self.raft_multiplier {
            config.raft_multiplier = v;
        }
        if let Some(v) = self.log_level {
            config.log_level = v;
        }
        if let Some(v) = self.metrics_addr {
            config.metrics_addr = v;
        }
        for (key, value) in self.tags {
            config.tags.insert(key, value);
        }
        config.normalize()?;
        Ok(config)
    }
}

/// Waits for Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_logging(level: &str) -> Result<(), String> {
    let filter = match level {
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        other => return Err(format!("unknown log level: {other}")),
    };
    env_logger::Builder::from_default_env()
        .filter_level(filter)
        .try_init()
        .unwrap_or_default();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => run_agent(args).await,
    }
}

async fn run_agent(args: AgentArgs) {
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("taskvault: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("taskvault: {e}");
        std::process::exit(1);
    }

    let mut agent = Agent::new(config);
    if let Err(e) = agent.start().await {
        log::error!("agent: startup failed: {e}");
        std::process::exit(1);
    }

    shutdown_signal().await;

    if let Err(e) = agent.stop().await {
        log::error!("agent: shutdown error: {e}");
        std::process::exit(1);
    }
}
