//! Node configuration: CLI flags with environment-variable fallbacks,
//! in the style of `couchestor::main::Args`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::ServerId;

fn parse_duration_secs(s: &str) -> std::result::Result<Duration, String> {
    s.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| e.to_string())
}

/// Command-line / environment configuration surface for a single node
/// process.
#[derive(Debug, Clone, Parser)]
#[command(name = "netraid-server", about = "NetRAID data server")]
pub struct Args {
    /// This server's cluster id.
    #[arg(long, env = "NETRAID_SERVER_ID")]
    pub server_id: u16,

    /// Root directory for this server's on-disk block store.
    #[arg(long, env = "NETRAID_STORAGE_PATH")]
    pub storage: PathBuf,

    /// Address this server listens on for peer (CCC/SPN) traffic.
    #[arg(long, env = "NETRAID_LISTEN_ADDR", default_value = "0.0.0.0:7800")]
    pub listen_addr: SocketAddr,

    /// Address the metadata server is reachable at.
    #[arg(long, env = "NETRAID_MDS_ADDR", default_value = "127.0.0.1:7000")]
    pub mds: SocketAddr,

    /// Address the Prometheus-format metrics endpoint binds to.
    #[arg(long, env = "NETRAID_METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,

    /// Address the liveness/readiness health endpoint binds to.
    #[arg(long, env = "NETRAID_HEALTH_ADDR", default_value = "0.0.0.0:9091")]
    pub health_addr: SocketAddr,

    /// `fsync` every written block before acknowledging it.
    #[arg(long, env = "NETRAID_FSYNC", default_value_t = false)]
    pub fsync: bool,

    /// Interval between garbage-collection sweeps.
    #[arg(long, env = "NETRAID_GC_INTERVAL_SECS", value_parser = parse_duration_secs, default_value = "30")]
    pub gc_interval: Duration,

    /// Interval between watchdog sweeps for stalled coordinator
    /// operations.
    #[arg(long, env = "NETRAID_WATCHDOG_INTERVAL_SECS", value_parser = parse_duration_secs, default_value = "2")]
    pub watchdog_interval: Duration,

    /// Enables the direct-write benchmarking subtype, which bypasses the
    /// commit protocol. Never enable this on a path that must tolerate
    /// failures.
    #[arg(long, env = "NETRAID_DIRECT_WRITE", default_value_t = false)]
    pub direct_write: bool,

    /// Log level filter passed to `tracing_subscriber::EnvFilter`.
    #[arg(long, env = "NETRAID_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Optional log file; when unset, logs go to stdout.
    #[arg(long, env = "NETRAID_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Cluster peer table as `id=host:port` pairs, comma-separated.
    /// Learned from the metadata server in the full system; supplied
    /// directly here since MDS session setup is out of this crate's
    /// scope.
    #[arg(long, env = "NETRAID_PEERS", value_delimiter = ',', default_value = "")]
    pub peers: Vec<String>,
}

/// Parses the `id=host:port` pairs accepted by [`Args::peers`].
pub fn parse_peers(entries: &[String]) -> Result<std::collections::HashMap<ServerId, SocketAddr>> {
    let mut peers = std::collections::HashMap::new();
    for entry in entries {
        if entry.is_empty() {
            continue;
        }
        let (id, addr) = entry
            .split_once('=')
            .ok_or_else(|| Error::InvalidConfig(format!("malformed peer entry: {entry}")))?;
        let id: ServerId = id
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("malformed peer id: {id}")))?;
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("malformed peer address: {addr}")))?;
        peers.insert(id, addr);
    }
    Ok(peers)
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval.is_zero() {
            return Err(Error::InvalidConfig("gc_interval must be nonzero".into()));
        }
        if self.watchdog_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "watchdog_interval must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

/// Resolved runtime configuration for a `Node`, derived from [`Args`]
/// plus the cluster's peer table (learned from the metadata server in
/// the full system; supplied directly here since MDS session setup is
/// out of this crate's scope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub server_id: ServerId,
    pub storage: PathBuf,
    pub listen_addr: SocketAddr,
    pub fsync: bool,
    pub gc_interval: Duration,
    pub watchdog_interval: Duration,
    pub direct_write: bool,
}

impl From<&Args> for NodeConfig {
    fn from(args: &Args) -> Self {
        Self {
            server_id: args.server_id,
            storage: args.storage.clone(),
            listen_addr: args.listen_addr,
            fsync: args.fsync,
            gc_interval: args.gc_interval,
            watchdog_interval: args.watchdog_interval,
            direct_write: args.direct_write,
        }
    }
}
