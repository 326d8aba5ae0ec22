//! Bastion Server - runs the ACL subsystem for one node of the cluster.

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use bastion_core::{
    config::{Config, StorageKind},
    consensus::{FileStorage, LogStorage, MemoryStorage},
    error::ErrorCode,
    node::{LocalCluster, NodeOptions},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "bastion-server", version, about = "Replicated ACL policy store")]
struct Args {
    /// Configuration file (JSON, TOML or YAML)
    #[arg(short, long, env = "BASTION_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let telemetry = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %config.node.node_id,
        datacenter = %config.node.datacenter,
        "Starting Bastion Server"
    );

    let storage: Arc<dyn LogStorage> = match config.consensus.storage {
        StorageKind::File => Arc::new(FileStorage::open(&config.node.data_dir)?),
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
    };

    let options = NodeOptions::from(&config);
    let cluster = LocalCluster::start(config.node.cluster_members(), storage, &options)?;
    let term = cluster.raft().elect(&config.node.node_id)?;
    tracing::info!(term, leader = %config.node.node_id, "Leadership established");

    let node = cluster.node(&config.node.node_id)?;
    let cancel = CancellationToken::new();
    match node
        .store()
        .bootstrap(config.acl.initial_management_token.clone(), &cancel)
        .await
    {
        Ok(token) => {
            tracing::info!(accessor_id = %token.accessor_id, "Management token created");
            if config.acl.initial_management_token.is_none() {
                // Generated secrets are shown once, on stdout only.
                println!("AccessorID: {}\nSecretID:   {}", token.accessor_id, token.secret_id);
            }
        }
        Err(e) if e.code() == ErrorCode::Conflict => {
            tracing::info!("ACL system already bootstrapped");
        }
        Err(e) => {
            e.log();
            return Err(e.into());
        }
    }

    shutdown_signal().await;

    cancel.cancel();
    cluster.shutdown().await;
    telemetry.shutdown();
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
