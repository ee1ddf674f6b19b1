use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info};

use fabricmon::agent::{AgentConfig, AgentHandler, LogDataplane, spawn_agent_worker};
use fabricmon::channel::CommandChannel;
use fabricmon::config::MonitorConfig;
use fabricmon::kv::{KvStore, sanitize_endpoints};
use fabricmon::store::Topology;
use fabricmon::sync::Synchronizer;
use fabricmon::worker::WorkerStatus;

/// Liveness key TTL; the key expires shortly after the monitor dies.
const ALIVE_TTL_SECS: i64 = 10;

#[derive(Parser)]
#[command(name = "fabricmon")]
#[command(about = "Per-host monitor for the fabric control plane", long_about = None)]
struct Cli {
    /// Comma-delimited list of config-store endpoints
    #[arg(long, default_value = "localhost:2379")]
    endpoints: String,

    /// Key prefix of the fabric state (must end with '/')
    #[arg(short, long, default_value = "/fabric/")]
    prefix: String,

    /// Stable id of this chassis
    #[arg(long)]
    chassis_id: String,

    /// Path to the packet agent binary
    #[arg(long, default_value = "pkt-agent")]
    agent: std::path::PathBuf,

    /// Log directory handed to the agent process
    #[arg(long)]
    log_dir: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = MonitorConfig {
        endpoints: sanitize_endpoints(&cli.endpoints),
        prefix: cli.prefix,
        chassis_id: cli.chassis_id,
        agent_bin: cli.agent,
        log_dir: cli.log_dir,
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        std::process::exit(1);
    }

    info!(chassis_id = %config.chassis_id, "starting fabric monitor");

    let store = match KvStore::connect(&config.endpoints, &config.prefix).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to connect to config store");
            std::process::exit(1);
        }
    };

    let topo = Arc::new(Topology::new());
    let (sync_handle, sync_status) =
        Synchronizer::new(Arc::clone(&topo), store.clone()).spawn();

    let channel = CommandChannel::new(store.clone());
    let handler = Arc::new(AgentHandler::new(
        Arc::clone(&topo),
        channel,
        Arc::new(LogDataplane),
        config.chassis_id.clone(),
    ));
    let agent_config = AgentConfig {
        agent_bin: config.agent_bin.clone(),
        log_dir: config.log_dir.clone(),
    };
    let (agent_handle, agent_status) = match spawn_agent_worker(handler, agent_config) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, agent = %config.agent_bin.display(), "failed to spawn packet agent");
            std::process::exit(1);
        }
    };

    // Session key so operators can see which monitors are alive.
    let alive_key = format!("{}communicate/alive/{}", store.root(), config.chassis_id);
    let alive_handle = match store
        .announce(&alive_key, &config.chassis_id, ALIVE_TTL_SECS)
        .await
    {
        Ok(h) => Some(h),
        Err(e) => {
            error!(error = %e, "failed to publish liveness key");
            None
        }
    };

    // Set up signal handlers
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        reason = wait_stopped(sync_status) => {
            error!(reason = %reason, "entity synchronizer stopped, shutting down");
        }
        reason = wait_stopped(agent_status) => {
            error!(reason = %reason, "agent worker stopped, shutting down");
        }
    }

    sync_handle.abort();
    agent_handle.abort();
    if let Some(h) = alive_handle {
        h.abort();
    }

    info!("Monitor stopped");
}

/// Resolve once a worker reports itself stopped.
async fn wait_stopped(mut status: watch::Receiver<WorkerStatus>) -> String {
    loop {
        if let Some(reason) = status.borrow().stop_reason() {
            return reason.to_string();
        }
        if status.changed().await.is_err() {
            return "status channel closed".to_string();
        }
    }
}
