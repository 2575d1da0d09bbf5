//! tillerd — the Tiller daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Worker pool draining the lifecycle job queue
//! - Heartbeat listener (UDP) and hand-off queue
//! - Liveness engine turning silence into failover jobs
//!
//! Infrastructure drivers (compute, network) bind at trait seams; the
//! standalone mode wires the in-process implementations, suitable for
//! development and for backends managed out of band.
//!
//! # Usage
//!
//! ```text
//! tillerd standalone --heartbeat-port 5555 --data-dir /var/lib/tiller \
//!     --heartbeat-key <key> --agent-key <key>
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tiller_agent::HttpAgentClient;
use tiller_coordinator::{MemoryClaimService, MemoryJobQueue, WorkerConfig, WorkerPool};
use tiller_coordinator::{ClaimedSparePool, JobQueue};
use tiller_flow::drivers::memory::{MemoryCompute, MemoryNetwork};
use tiller_flow::task::TaskContext;
use tiller_health::listener::HandoffQueue;
use tiller_health::{HeartbeatListener, ListenerStats, LivenessConfig, LivenessEngine};
use tiller_store::StateStore;

#[derive(Parser)]
#[command(name = "tillerd", about = "Tiller load balancer control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (single-node, all subsystems in one process).
    Standalone {
        /// UDP port the heartbeat listener binds.
        #[arg(long, default_value = "5555")]
        heartbeat_port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/tiller")]
        data_dir: PathBuf,

        /// Number of lifecycle workers.
        #[arg(long, default_value = "2")]
        workers: usize,

        /// Liveness tick interval in seconds.
        #[arg(long, default_value = "10")]
        tick_interval: u64,

        /// Pre-shared key authenticating amphora heartbeats.
        #[arg(long, env = "TILLER_HEARTBEAT_KEY")]
        heartbeat_key: String,

        /// Pre-shared key signing agent API requests.
        #[arg(long, env = "TILLER_AGENT_KEY")]
        agent_key: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tillerd=debug,tiller=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            heartbeat_port,
            data_dir,
            workers,
            tick_interval,
            heartbeat_key,
            agent_key,
        } => {
            run_standalone(
                heartbeat_port,
                data_dir,
                workers,
                tick_interval,
                heartbeat_key,
                agent_key,
            )
            .await
        }
    }
}

async fn run_standalone(
    heartbeat_port: u16,
    data_dir: PathBuf,
    workers: usize,
    tick_interval: u64,
    heartbeat_key: String,
    agent_key: String,
) -> anyhow::Result<()> {
    info!("tiller daemon starting in standalone mode");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("tiller.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let agent = Arc::new(HttpAgentClient::new(agent_key.into_bytes()));
    let compute = Arc::new(MemoryCompute::new());
    let network = Arc::new(MemoryNetwork::new());
    let claims = Arc::new(MemoryClaimService::new());
    let spares = Arc::new(ClaimedSparePool::new(store.clone(), claims.clone()));
    let ctx = TaskContext {
        store: store.clone(),
        compute,
        network,
        agent: agent.clone(),
        spares,
    };

    let queue = Arc::new(MemoryJobQueue::new());
    info!("job queue and claim service initialized");

    let handoff = Arc::new(HandoffQueue::new(1024));
    let stats = Arc::new(ListenerStats::default());
    let listener = HeartbeatListener::new(heartbeat_key.into_bytes());

    let engine = Arc::new(
        LivenessEngine::new(store.clone(), queue.clone() as Arc<dyn JobQueue>, agent)
            .with_config(LivenessConfig {
                heartbeat_interval: Duration::from_secs(tick_interval),
                ..LivenessConfig::default()
            }),
    );
    info!(tick_interval, "liveness engine initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let pool = WorkerPool::new(store, queue, claims, ctx).with_config(WorkerConfig {
        workers,
        ..WorkerConfig::default()
    });
    let worker_handles = pool.spawn(shutdown_rx.clone());
    info!(workers, "worker pool started");

    let addr = SocketAddr::from(([0, 0, 0, 0], heartbeat_port));
    let socket = tokio::net::UdpSocket::bind(addr).await?;
    let listener_queue = handoff.clone();
    let listener_stats = stats.clone();
    let listener_shutdown = shutdown_rx.clone();
    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener
            .run(socket, &listener_queue, &listener_stats, listener_shutdown)
            .await
        {
            warn!(error = %e, "heartbeat listener failed");
        }
    });
    info!(%addr, "heartbeat listener started");

    let engine_queue = handoff.clone();
    let engine_shutdown = shutdown_rx.clone();
    let engine_handle = tokio::spawn(async move {
        if let Err(e) = engine
            .run(
                engine_queue,
                Duration::from_secs(tick_interval),
                engine_shutdown,
            )
            .await
        {
            warn!(error = %e, "liveness engine failed");
        }
    });

    // ── Graceful shutdown on Ctrl-C ────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = listener_handle.await;
    let _ = engine_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }

    let snapshot = stats.snapshot();
    info!(
        received = snapshot.received,
        accepted = snapshot.accepted,
        "tiller daemon stopped"
    );
    Ok(())
}
