//! Agent configuration: defaults, TOML overlay, address normalization.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reconcile::DEFAULT_SELF_JOIN_THRESHOLD;

pub const DEFAULT_GOSSIP_PORT: u16 = 8946;
pub const DEFAULT_RPC_PORT: u16 = 6868;
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server role; the agent refuses to start without it.
    pub server: bool,
    pub node_name: String,
    /// Gossip bind address (`host:port`).
    pub bind_addr: String,
    /// Address advertised to peers; defaults to the bind address.
    pub advertise_addr: String,
    /// Multiplexed gRPC + raft port.
    pub rpc_port: u16,
    /// Advertised RPC port; 0 means same as `rpc_port`.
    pub advertise_rpc_port: u16,
    pub data_dir: PathBuf,
    /// In-memory stores, single process; for tests and demos.
    pub dev_mode: bool,
    pub bootstrap: bool,
    pub bootstrap_expect: u32,
    pub start_join: Vec<String>,
    pub retry_join: Vec<String>,
    pub retry_join_interval: String,
    /// Base64 gossip encryption key; empty disables sealing.
    pub encrypt_key: String,
    pub profile: String,
    pub serf_reconnect_timeout: String,
    pub refresh_interval: String,
    pub self_join_threshold: usize,
    pub raft_multiplier: usize,
    pub log_level: String,
    pub metrics_addr: String,
    pub tags: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: false,
            node_name: String::new(),
            bind_addr: format!("0.0.0.0:{DEFAULT_GOSSIP_PORT}"),
            advertise_addr: String::new(),
            rpc_port: DEFAULT_RPC_PORT,
            advertise_rpc_port: 0,
            data_dir: PathBuf::from("taskvault.data"),
            dev_mode: false,
            bootstrap: false,
            bootstrap_expect: 0,
            start_join: Vec::new(),
            retry_join: Vec::new(),
            retry_join_interval: "30s".to_string(),
            encrypt_key: String::new(),
            profile: "lan".to_string(),
            serf_reconnect_timeout: "24h".to_string(),
            refresh_interval: "30s".to_string(),
            self_join_threshold: DEFAULT_SELF_JOIN_THRESHOLD,
            raft_multiplier: 1,
            log_level: "info".to_string(),
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            tags: HashMap::new(),
        }
    }
}

impl Config {
    /// Loads the optional TOML overlay; flags are applied on top by the
    /// CLI layer.
    pub fn from_file(path: &Path) -> Result<Config> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
    }

    /// Fills derived fields and validates everything that must be fatal
    /// at startup.
    pub fn normalize(&mut self) -> Result<()> {
        if !self.server {
            return Err(Error::Config(
                "client mode is not supported; start the agent with --server".into(),
            ));
        }
        if self.node_name.is_empty() {
            self.node_name = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| {
                    Error::Config("node name is required (--node-name or $HOSTNAME)".into())
                })?;
        }
        if self.advertise_rpc_port == 0 {
            self.advertise_rpc_port = self.rpc_port;
        }
        if self.bootstrap_expect == 1 {
            self.bootstrap = true;
        }
        if self.raft_multiplier == 0 {
            self.raft_multiplier = 1;
        }

        // Resolve everything once so bad values abort startup.
        self.gossip_bind_addr()?;
        self.gossip_advertise_addr()?;
        self.retry_join_interval()?;
        self.serf_reconnect_timeout()?;
        self.refresh_interval()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn gossip_bind_addr(&self) -> Result<SocketAddr> {
        let (ip, port) = addr_parts(&self.bind_addr, DEFAULT_GOSSIP_PORT)?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn gossip_advertise_addr(&self) -> Result<SocketAddr> {
        if self.advertise_addr.is_empty() {
            return self.gossip_bind_addr();
        }
        let bind_port = self.gossip_bind_addr()?.port();
        let (ip, port) = addr_parts(&self.advertise_addr, bind_port)?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn bind_rpc_addr(&self) -> Result<SocketAddr> {
        let (ip, _) = addr_parts(&self.bind_addr, DEFAULT_GOSSIP_PORT)?;
        Ok(SocketAddr::new(ip, self.rpc_port))
    }

    /// The RPC endpoint peers should dial: advertised IP, advertised
    /// RPC port.
    pub fn advertise_rpc_addr(&self) -> Result<SocketAddr> {
        let ip = self.gossip_advertise_addr()?.ip();
        Ok(SocketAddr::new(ip, self.advertise_rpc_port))
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid metrics address: {e}")))
    }

    pub fn retry_join_interval(&self) -> Result<Duration> {
        parse_duration(&self.retry_join_interval)
    }

    pub fn serf_reconnect_timeout(&self) -> Result<Duration> {
        parse_duration(&self.serf_reconnect_timeout)
    }

    pub fn refresh_interval(&self) -> Result<Duration> {
        parse_duration(&self.refresh_interval)
    }

    /// True when this node should seed a fresh cluster if no durable
    /// state exists yet.
    pub fn should_bootstrap(&self) -> bool {
        self.bootstrap || self.dev_mode
    }
}

/// Splits `host:port` (or a bare host) into a resolved IP and port.
pub fn addr_parts(addr: &str, default_port: u16) -> Result<(IpAddr, u16)> {
    let candidate = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    };
    let resolved = candidate
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid address {addr}: {e}")))?
        .next()
        .ok_or_else(|| Error::Config(format!("address {addr} did not resolve")))?;
    Ok((resolved.ip(), resolved.port()))
}

/// Parses `300ms`, `30s`, `5m`, `2h`, or a bare number of seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let bad = || Error::Config(format!("invalid duration: {value}"));
    if value.is_empty() {
        return Err(bad());
    }
    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => value.split_at(split),
        None => (value, "s"),
    };
    let number: u64 = number.parse().map_err(|_| bad())?;
    match unit {
        "ms" => Ok(Duration::from_millis(number)),
        "s" => Ok(Duration::from_secs(number)),
        "m" => Ok(Duration::from_secs(number * 60)),
        "h" => Ok(Duration::from_secs(number * 3600)),
        _ => Err(bad()),
    }
}

/// Parser for repeatable `--tag key=value` flags.
pub fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}
