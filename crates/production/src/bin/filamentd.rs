//! Filament validator daemon.
//!
//! # Usage
//!
//! ```bash
//! # Create a validator identity
//! filamentd keygen --datadir ./node0
//!
//! # Run against a datadir containing priv_key and peers.json
//! filamentd run --datadir ./node0 --listen 127.0.0.1:1337 --store
//!
//! # Reopen an existing database instead of renaming it away
//! filamentd run --datadir ./node0 --store --bootstrap
//! ```
//!
//! Options may also come from a TOML file (`--config node.toml`); command
//! line flags win. The daemon runs with the in-memory dummy application;
//! real deployments attach their own gateway through the library API.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use filament_production::{
    build_state_machine, init_telemetry, load_key, save_key, serve_metrics, Metrics, NodeRunner,
    RunnerConfig, TcpTransport,
};
use filament_gateway::InmemGateway;
use filament_types::KeyPair;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "filamentd", version, about = "Filament consensus node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a validator key into the datadir.
    Keygen {
        #[arg(long, default_value = ".filament")]
        datadir: PathBuf,
    },
    /// Run the node.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Data directory (priv_key, peers.json, database).
    #[arg(long, default_value = ".filament")]
    datadir: PathBuf,

    /// Optional TOML configuration file; flags override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Gossip listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Address advertised to peers (when it differs from --listen).
    #[arg(long)]
    advertise: Option<String>,

    /// Friendly node name.
    #[arg(long)]
    moniker: Option<String>,

    /// Log filter when RUST_LOG is unset.
    #[arg(long)]
    log: Option<String>,

    /// Gossip period in milliseconds while busy.
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Gossip period in milliseconds while idle.
    #[arg(long)]
    slow_heartbeat: Option<u64>,

    /// Sync connection timeout in milliseconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Join request timeout in milliseconds.
    #[arg(long)]
    join_timeout: Option<u64>,

    /// Maximum events per sync response.
    #[arg(long)]
    sync_limit: Option<usize>,

    /// Store cache capacity.
    #[arg(long)]
    cache_size: Option<usize>,

    /// Connections pooled per peer.
    #[arg(long)]
    max_pool: Option<usize>,

    /// Use persistent storage.
    #[arg(long)]
    store: bool,

    /// Open the existing database instead of renaming it away.
    #[arg(long)]
    bootstrap: bool,

    /// Start suspended (implies --bootstrap, which implies --store).
    #[arg(long)]
    maintenance_mode: bool,

    /// Enable snapshot catch-up.
    #[arg(long)]
    fast_sync: bool,

    /// Undecided-event threshold that suspends the node.
    #[arg(long)]
    suspend_limit: Option<usize>,

    /// Prometheus endpoint address.
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

/// TOML configuration file, all fields optional.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen: Option<String>,
    advertise: Option<String>,
    moniker: Option<String>,
    log: Option<String>,
    heartbeat: Option<u64>,
    slow_heartbeat: Option<u64>,
    timeout: Option<u64>,
    join_timeout: Option<u64>,
    sync_limit: Option<usize>,
    cache_size: Option<usize>,
    max_pool: Option<usize>,
    store: Option<bool>,
    bootstrap: Option<bool>,
    maintenance_mode: Option<bool>,
    fast_sync: Option<bool>,
    suspend_limit: Option<usize>,
    metrics_addr: Option<SocketAddr>,
}

impl RunArgs {
    fn into_config(self) -> Result<RunnerConfig> {
        let file: FileConfig = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let mut config = RunnerConfig {
            datadir: self.datadir,
            ..Default::default()
        };
        if let Some(listen) = self.listen.or(file.listen) {
            config.bind_addr = listen;
        }
        config.advertise_addr = self.advertise.or(file.advertise);
        config.metrics_addr = self.metrics_addr.or(file.metrics_addr);
        if let Some(log) = self.log.or(file.log) {
            config.log_level = log;
        }

        let node = &mut config.node;
        if let Some(moniker) = self.moniker.or(file.moniker) {
            node.moniker = moniker;
        }
        if let Some(ms) = self.heartbeat.or(file.heartbeat) {
            node.heartbeat = Duration::from_millis(ms);
        }
        if let Some(ms) = self.slow_heartbeat.or(file.slow_heartbeat) {
            node.slow_heartbeat = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout.or(file.timeout) {
            node.tcp_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.join_timeout.or(file.join_timeout) {
            node.join_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.sync_limit.or(file.sync_limit) {
            node.sync_limit = v;
        }
        if let Some(v) = self.cache_size.or(file.cache_size) {
            node.cache_size = v;
        }
        if let Some(v) = self.max_pool.or(file.max_pool) {
            node.max_pool = v;
        }
        if let Some(v) = self.suspend_limit.or(file.suspend_limit) {
            node.suspend_limit = v;
        }
        node.store = self.store || file.store.unwrap_or(false);
        node.bootstrap = self.bootstrap || file.bootstrap.unwrap_or(false);
        node.maintenance_mode = self.maintenance_mode || file.maintenance_mode.unwrap_or(false);
        node.enable_fast_sync = self.fast_sync || file.fast_sync.unwrap_or(false);
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Keygen { datadir } => keygen(datadir),
        Command::Run(args) => run(args.into_config()?).await,
    }
}

fn keygen(datadir: PathBuf) -> Result<()> {
    std::fs::create_dir_all(&datadir)?;
    let key = KeyPair::generate();
    save_key(&datadir, &key).context("writing priv_key")?;
    println!("{}", key.public_key().to_hex());
    Ok(())
}

async fn run(config: RunnerConfig) -> Result<()> {
    init_telemetry(&config.log_level)?;
    info!(datadir = %config.datadir.display(), "Starting filamentd");

    let key = load_key(&config.datadir)
        .context("loading priv_key (run `filamentd keygen` first)")?;
    let sm = build_state_machine(
        config.node.clone(),
        &config.datadir,
        key,
        config.advertise(),
    )?;

    let (net_shutdown_tx, net_shutdown_rx) = broadcast::channel(1);
    let (transport, inbound_rx) =
        TcpTransport::bind(&config.bind_addr, config.node.max_pool, net_shutdown_rx).await?;
    info!(addr = %transport.local_addr(), "Gossip transport bound");

    let metrics = Arc::new(Metrics::new()?);
    let gateway = Arc::new(InmemGateway::new());
    let runner = NodeRunner::new(sm, transport, inbound_rx, gateway, metrics.clone());
    let handle = runner.handle();

    if let Some(addr) = config.metrics_addr {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr, metrics).await {
                tracing::error!(error = %e, "Metrics endpoint failed");
            }
        });
    }

    // Ctrl-C initiates an orderly shutdown; the transport follows the
    // runner down.
    {
        let handle = handle.clone();
        tokio::spawn(async move {
            let _ = signal::ctrl_c().await;
            info!("Interrupt received; shutting down");
            handle.shutdown().await;
        });
    }
    {
        let mut runner_down = handle.subscribe_shutdown();
        tokio::spawn(async move {
            let _ = runner_down.recv().await;
            let _ = net_shutdown_tx.send(());
        });
    }

    runner.run().await;
    Ok(())
}
