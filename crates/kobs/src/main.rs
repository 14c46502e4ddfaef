use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kobs::{config::Config, server::Server, JobManager};

/// Watches batch Jobs and deletes the ones that have finished.
#[derive(Debug, Parser)]
#[command(name = "kobs", version)]
struct Args {
    /// Only reap jobs in this namespace (default: all namespaces)
    #[arg(long)]
    namespace: Option<String>,

    /// Full resync period in seconds; 0 uses the default
    #[arg(long)]
    resync_secs: Option<u64>,

    /// Address for the health and metrics endpoints
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(namespace) = args.namespace {
        config.reconciler.namespace = namespace;
    }
    if let Some(resync_secs) = args.resync_secs {
        config.reconciler.resync_secs = resync_secs;
    }
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    info!("Loaded configuration: {:?}", config);

    let manager = Arc::new(
        JobManager::connect(None)?.with_event_buffer(config.reconciler.event_buffer),
    );

    manager.start(&config.reconciler.namespace, config.reconciler.resync())?;

    let server = Server::new(&config, manager.clone());
    server
        .start(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    manager.shutdown().await;
    Ok(())
}
