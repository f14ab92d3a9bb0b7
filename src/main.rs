use anyhow::Result;

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use replistore::events::{EventHandle, StoreEvent};
use replistore::raft::http_rpc::{build_raft_rpc_router, RaftRpcState};
use replistore::raft::network_http::HttpNetworkFactory;
use replistore::raft::runtime::start_raft;
use replistore::raft::storage::RaftPaths;
use replistore::store::SqlStore;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = replistore::config::Cli::parse();
    let cmd = cli
        .command
        .clone()
        .unwrap_or(replistore::config::Command::Run);

    match cmd {
        replistore::config::Command::Run => run_server(cli.config).await,
        replistore::config::Command::Init => init_node(&cli.config),
    }
}

/// Lay out the data directory and create an empty store so operators can
/// inspect or pre-seed it before first start.
fn init_node(config: &replistore::config::Config) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;
    RaftPaths::new(&config.data_dir).ensure_dirs()?;
    let store = SqlStore::open(&config.data_dir)?;
    info!(
        db = %store.db_path().display(),
        node_id = config.node_id,
        "initialized node data directory"
    );
    Ok(())
}

async fn run_server(config: replistore::config::Config) -> Result<()> {
    let (events, mut event_rx) = EventHandle::channel();

    let raft = start_raft(
        &config.data_dir,
        config.cluster_name.clone(),
        config.node_id,
        events,
        HttpNetworkFactory::new(),
    )
    .await?;

    if config.bootstrap {
        raft.initialize_single_node_if_needed(config.node_id, config.node_meta())
            .await?;
    }

    // Downstream caches would subscribe here; the binary just surfaces the
    // events in the log.
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                StoreEvent::Reloaded => info!("store reloaded from snapshot"),
                StoreEvent::Degraded { reason } => warn!(%reason, "store degraded"),
            }
        }
    });

    let app = build_raft_rpc_router(RaftRpcState { raft: raft.raft() })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!(
        bind = %config.raft_bind,
        data_dir = %config.data_dir.display(),
        node_id = config.node_id,
        "starting replistore"
    );
    let listener = tokio::net::TcpListener::bind(config.raft_bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
