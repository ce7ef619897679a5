// Several components here are exercised through the socket layer and the
// integration tests rather than called directly from main.
#![allow(dead_code)]

mod defaults;
mod hosts;
mod logs;
mod paths;
mod proctree;
mod proxy;
mod readiness;
mod socket;
mod state_store;
mod supervisor;
mod tailer;

use crate::hosts::HostAllocator;
use crate::proxy::{ProxyConfig, RouteManager};
use crate::readiness::ReadinessConfig;
use crate::socket::{Daemon, SocketServer};
use crate::state_store::SqliteStateStore;
use crate::supervisor::Supervisor;
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Canopy Server - supervisor daemon for per-worktree dev servers
#[derive(Parser)]
#[command(name = "canopy-server")]
#[command(version)]
#[command(about = "Canopy Server - supervisor daemon for per-worktree dev servers")]
struct Args {
    /// Unix socket path for control commands
    #[arg(long, env = "CANOPY_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory for durable state and captured logs
    #[arg(long, env = "CANOPY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Admin API base URL of the external reverse proxy
    #[arg(long, env = "CANOPY_PROXY_ADMIN_URL", default_value = defaults::PROXY_ADMIN_URL)]
    proxy_admin_url: String,

    /// Ports forwarded when a proxy is enabled (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "3000")]
    proxy_ports: Vec<u16>,

    /// Total readiness timeout in seconds
    #[arg(long, default_value_t = defaults::READY_TOTAL_TIMEOUT.as_secs())]
    ready_timeout_secs: u64,

    /// Idle readiness timeout in seconds (measured from the last output line)
    #[arg(long, default_value_t = defaults::READY_IDLE_TIMEOUT.as_secs())]
    ready_idle_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => paths::canopy_home()?,
    };
    let socket_path = match args.socket {
        Some(path) => path,
        None => paths::default_socket_path()?,
    };

    std::fs::create_dir_all(&data_dir)?;
    let store = Arc::new(SqliteStateStore::new(paths::state_db_path(&data_dir)));
    store.init()?;

    let hosts = Arc::new(HostAllocator::load(store.clone())?);
    let proxy = Arc::new(RouteManager::load(
        ProxyConfig {
            admin_url: args.proxy_admin_url,
            ports: args.proxy_ports,
            timeout: defaults::PROXY_ADMIN_TIMEOUT,
        },
        store.clone(),
    )?);
    let readiness = ReadinessConfig {
        total_timeout: Duration::from_secs(args.ready_timeout_secs),
        idle_timeout: Duration::from_secs(args.ready_idle_secs),
        ..ReadinessConfig::default()
    };

    let supervisor = Supervisor::new(
        data_dir.clone(),
        store,
        hosts,
        proxy.clone(),
        readiness,
    );

    // Self-heal from whatever a previous daemon instance left behind before
    // accepting any commands.
    supervisor.reconcile_orphans().await?;
    let active: HashSet<PathBuf> = supervisor.list().iter().map(|m| m.path.clone()).collect();
    proxy.reconcile(&active).await;
    tracing::info!(
        servers = supervisor.count(),
        data_dir = %data_dir.display(),
        "supervisor state reconciled"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let daemon = Arc::new(Daemon::new(supervisor, shutdown_tx));

    let server = SocketServer::new(socket_path.clone());
    tokio::select! {
        result = server.run(daemon, shutdown_rx) => {
            result?;
            tracing::info!("shutdown requested over the control socket");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
        }
    }

    // Managed servers keep running detached; the next daemon instance
    // re-attaches to them.
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
