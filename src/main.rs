use anyhow::{Context as _, Result};

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use riot::{
    cluster::ClusterSlot,
    config::{Cli, Command, Config},
    peers::{JsonPeerStore, bootstrap_mode, merge_peers},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Peers => print_peers(&cli.config),
    }
}

async fn run_server(config: Config) -> Result<()> {
    info!(
        version = riot::version::VERSION,
        node_id = config.node_id,
        bind = %config.bind,
        raft_bind = %config.raft_bind,
        data_dir = %config.data_dir.display(),
        "starting riot"
    );

    if config.api_advertise().is_empty() {
        warn!(
            bind = %config.bind,
            "api bound to a wildcard address without --api-advertise; followers cannot redirect writes"
        );
    }

    let slot = ClusterSlot::new();
    let node = slot
        .get_or_start(config.cluster_config())
        .await
        .context("start cluster node")?;

    let app = riot::http::build_router(node.clone()).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("bind api listener {}", config.bind))?;
    info!(addr = %config.bind, "api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve api")?;

    node.shutdown().await
}

/// Show what `run` would do with the peer list, without touching the file.
fn print_peers(config: &Config) -> Result<()> {
    let cluster = config.cluster_config();
    let store = JsonPeerStore::new(cluster.peer_store_path());
    let stored = store.load().context("load peer store")?;
    let peers = merge_peers(
        cluster.node_id,
        &cluster.raft_advertise,
        stored,
        &cluster.peers,
    );
    let mode = bootstrap_mode(cluster.enable_single_node, &peers);

    println!("peer store: {}", store.path().display());
    println!("bootstrap: {mode}");
    for peer in &peers {
        println!("{peer}");
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

