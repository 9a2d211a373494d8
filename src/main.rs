use anyhow::{Context, Result};
use clap::Parser;
use quickpoll::config::{ServerConfig, StoreConfig};
use quickpoll::session_daemon::{serve, ServiceSettings, VotingService, BUILD_SHA};
use quickpoll::store;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quickpoll")]
#[command(about = "Real-time voting sessions over newline-delimited JSON")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.quickpoll/config.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file and QUICKPOLL_BIND
    #[arg(short, long)]
    bind: Option<String>,

    /// Persist sessions as JSON files in this directory
    #[arg(long)]
    store_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quickpoll=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    tracing::info!(
        version = BUILD_SHA,
        bind = %config.bind_addr,
        store = ?config.store,
        "starting quickpoll"
    );

    let store = store::open(&config.store).context("Failed to open session store")?;
    let service = VotingService::new(store, ServiceSettings::from_config(&config));
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("interrupt received");
        let _ = signal_tx.send(());
    });

    serve(listener, service, config.sweep_interval(), shutdown_tx).await
}

/// Config file, then environment, then command line.
fn resolve_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = ServerConfig::load_or_default(cli.config.as_deref())?;
    config.apply_env_overrides();

    if let Some(bind) = &cli.bind {
        config.bind_addr = bind.clone();
    }
    if let Some(dir) = &cli.store_dir {
        config.store = StoreConfig::File {
            dir: Some(dir.clone()),
        };
    }

    config.validate()?;
    Ok(config)
}
