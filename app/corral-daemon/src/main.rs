//! corrald: the corral container supervisor daemon.

mod rpc;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corral_config::Config;
use corral_container::{ContainerHolder, Env, ProcessLauncher, VolumeHolder};

use crate::rpc::Context;
use crate::server::Server;

#[derive(Debug, Parser)]
#[command(name = "corrald")]
#[command(author, version, about, long_about = None)]
struct DaemonArgs {
    /// Unix socket path for the client API.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Configuration file instead of the default search path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory override.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corral=info,corrald=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(DaemonArgs::parse()).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => Config::load_from(path).context("failed to load configuration")?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(socket) = args.socket {
        config.daemon.socket_path = socket;
    }
    if let Some(data_dir) = args.data_dir {
        config.daemon.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.daemon.data_dir)
        .context("failed to create data directory")?;
    let pid_file = config.daemon.pid_file.clone();
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("failed to write pid file")?;

    let socket_path = config.daemon.socket_path.clone();
    let reconcile_interval = Duration::from_millis(config.daemon.reconcile_interval_ms);
    let pool_dir = config.volumes.pool_dir.clone();

    let env = Env::new(config, Box::new(ProcessLauncher))
        .context("failed to build engine environment")?;

    let mut cholder = ContainerHolder::new(Arc::clone(&env));
    cholder
        .restore_all()
        .await
        .context("failed to restore container state")?;
    info!(containers = cholder.list().len(), "state restored");

    // Reset the traffic-control root after restore so no class of the
    // previous daemon generation survives.
    env.setup_network()
        .context("failed to set up traffic control")?;

    let vholder = VolumeHolder::open(pool_dir).context("failed to open volume pool")?;

    let ctx = Arc::new(Mutex::new(Context { cholder, vholder }));

    let reconciler = server::spawn_reconciler(Arc::clone(&ctx), reconcile_interval);

    let server = Server::new(socket_path.clone(), Arc::clone(&ctx));
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            tracing::error!(error = %e, "server error");
        }
    });

    info!("corrald started");
    shutdown_signal().await;
    info!("shutdown signal received");

    server_handle.abort();
    reconciler.abort();

    // Compact every node so the next boot replays the minimum.
    ctx.lock().await.cholder.sync_all();

    for path in [&socket_path, &pid_file] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "can't remove file");
            }
        }
    }

    info!("corrald stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
