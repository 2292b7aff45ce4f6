//! # Muster - Cluster Formation Coordinator
//!
//! Runs next to a consensus agent on every instance of an elastic fleet.
//! Joins an existing cluster when one answers, otherwise elects exactly one
//! bootstrapper through a shared lease and forms the cluster.
//!
//! ## Architecture
//! ```text
//!             ┌──────── fleet peers (/v1/status/peers)
//!             │
//! Muster ─────┼──────── Redis (bootstrap lease)
//!   │         │
//!   │         └──────── local agent process (launch / leave)
//!   ↓
//! Front door (/health, /ready, /api → agent HTTP API)
//! ```

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod agent;
mod cluster;
mod config;
mod routes;
mod state;
#[cfg(test)]
mod testing;

use agent::{ProcessSupervisor, Supervisor};
use cluster::{
    Coordinator, DiscoveryProber, HttpPeerClient, LeaseLock, LeaseStore, MemoryLeaseStore, PeerQuery,
    RedisLeaseStore, StaticFleet,
};
use config::{AppConfig, LockBackend};
use muster_common::{ClusterError, FormationState};
use state::AppState;

/// Timeout for requests proxied to the agent API
const PROXY_TIMEOUT: Duration = Duration::from_secs(25);

/// Muster - cluster formation coordinator
#[derive(Parser, Debug)]
#[command(name = "muster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/muster.toml")]
    config: String,

    /// Redis URL for the bootstrap lease (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Front door listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Agent node name (overrides config)
    #[arg(long, env = "MUSTER_NODE_NAME")]
    node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

enum AgentExit {
    Signal,
    Exited(Result<(), ClusterError>),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🔥 Starting Muster v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    let cluster_config = config.cluster_config()?;
    let peers = config.fleet_peers()?;
    info!(
        node = %cluster_config.node_name(),
        peers = peers.len(),
        "📋 Configuration loaded from {}",
        args.config
    );

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (state_tx, state_rx) = watch::channel(FormationState::Discovering);

    // Front door
    let app_state = AppState::new(
        cluster_config.node_name(),
        state_rx,
        cluster_config.http_api_url(),
        PROXY_TIMEOUT,
    )?;
    let app = routes::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("🚀 Muster listening on {}", config.listen_addr);

    let mut server_shutdown = shutdown_tx.subscribe();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
    });

    // Lock store
    let store: Arc<dyn LeaseStore> = match config.lock.backend {
        LockBackend::Redis => {
            let store = RedisLeaseStore::connect(&config.lock.redis_url, config.lock.container.clone()).await?;
            info!("✅ Redis connected: {}", config.lock.redis_url);
            Arc::new(store)
        }
        LockBackend::Memory => {
            warn!("Using in-process lease store; only safe for a single instance");
            Arc::new(MemoryLeaseStore::new())
        }
    };

    let client: Arc<dyn PeerQuery> = Arc::new(HttpPeerClient::new(config.probe_timeout())?);
    let prober = DiscoveryProber::new(client.clone(), config.probe_timeout());
    let lock = LeaseLock::new(
        store,
        config.lock.resource.clone(),
        config.lease_duration(),
        cluster_config.node_name(),
    )
    .with_call_timeout(config.lock_call_timeout());
    let supervisor = Arc::new(ProcessSupervisor::new(
        &config.agent.binary,
        config.agent.config_dir.clone(),
        config.launch_grace(),
    )
    .with_wrapper_args(config.agent.wrapper_args.clone())
    .with_leave_timeout(config.leave_timeout()));
    let fleet = Arc::new(StaticFleet::new(cluster_config, peers));

    let coordinator = Coordinator::new(
        fleet,
        client,
        prober,
        lock,
        supervisor.clone(),
        config.formation_settings(),
        state_tx,
    );

    // Dropping the coordinator on Ctrl+C kills any agent it started; a held
    // lease then lapses on its own.
    let formed = tokio::select! {
        result = coordinator.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    let mut formation = match formed {
        Some(Ok(formation)) => formation,
        Some(Err(e)) => {
            let _ = shutdown_tx.send(());
            return Err(e).context("Cluster formation failed");
        }
        None => {
            info!("🛑 Shutdown signal received during formation");
            let _ = shutdown_tx.send(());
            return Ok(());
        }
    };

    info!(
        path = ?formation.path,
        members = formation.members.len(),
        pid = formation.process.pid(),
        mode = %formation.process.mode(),
        "✅ Agent running in the cluster"
    );

    let exit = tokio::select! {
        _ = tokio::signal::ctrl_c() => AgentExit::Signal,
        result = supervisor.wait_for_exit(&mut formation.process) => AgentExit::Exited(result),
    };

    let result = match exit {
        AgentExit::Signal => {
            info!("🛑 Shutdown signal received, leaving the cluster");
            supervisor.shutdown(&mut formation.process).await?;
            supervisor.wait_for_exit(&mut formation.process).await?;
            Ok(())
        }
        AgentExit::Exited(result) => {
            let status = formation.process.exit_status();
            error!(status = ?status, "Agent exited unexpectedly");
            result?;
            Err(anyhow!("agent exited unexpectedly ({:?})", status))
        }
    };

    let _ = shutdown_tx.send(());
    match server.await {
        Ok(served) => served.context("Server error")?,
        Err(e) => warn!(error = %e, "Front door task failed"),
    }

    info!("👋 Muster shutdown complete");
    result
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
