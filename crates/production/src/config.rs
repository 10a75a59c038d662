//! Runner-level configuration: addresses, datadir, telemetry.

use filament_node::NodeConfig;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Everything outside the consensus core: where to listen, where data
/// lives, what to report. The embedded [`NodeConfig`] carries the
/// consensus options.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Top-level directory with `priv_key`, `peers.json` and the database.
    pub datadir: PathBuf,
    /// Local address the transport binds.
    pub bind_addr: String,
    /// Address advertised to other peers; defaults to `bind_addr`.
    /// Divergence is resolved at configuration time only.
    pub advertise_addr: Option<String>,
    /// Prometheus endpoint; disabled when unset.
    pub metrics_addr: Option<SocketAddr>,
    /// Default log filter, overridden by `RUST_LOG`.
    pub log_level: String,
    pub node: NodeConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            datadir: PathBuf::from(".filament"),
            bind_addr: "127.0.0.1:1337".to_string(),
            advertise_addr: None,
            metrics_addr: None,
            log_level: "debug".to_string(),
            node: NodeConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// The address other peers should reach us at.
    pub fn advertise(&self) -> &str {
        self.advertise_addr.as_deref().unwrap_or(&self.bind_addr)
    }
}
