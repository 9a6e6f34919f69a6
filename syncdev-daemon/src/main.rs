//! syncdevd: the syncdev engine daemon

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use syncdev_daemon::{ConfigStore, Engine, FileSecretStore};

#[derive(Parser, Debug)]
#[command(name = "syncdevd", about = "Peer-to-peer folder sync daemon", version)]
struct Args {
    /// Data directory (defaults to ~/.syncdev)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(long)]
    port: Option<u16>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("syncdev={default_level}"))),
        )
        .init();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .context("home directory not found")?
            .join(".syncdev"),
    };

    let config = Arc::new(
        ConfigStore::open(&data_dir)
            .with_context(|| format!("failed to open config in {}", data_dir.display()))?,
    );
    if let Some(port) = args.port {
        config.update(|c| c.port = port)?;
    }

    let secrets = Arc::new(
        FileSecretStore::open(config.secrets_dir()).context("failed to open secret store")?,
    );

    let engine = Engine::new(config, secrets, Arc::new(()))
        .await
        .context("failed to build engine")?;
    engine.start().await.context("failed to start engine")?;

    info!("syncdevd running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    engine.stop().await;
    Ok(())
}
