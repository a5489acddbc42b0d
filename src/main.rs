//! Relay server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use coderelay::adapter::ProcessAdapter;
use coderelay::broadcast::Broadcaster;
use coderelay::config::RelayConfig;
use coderelay::runner::ExecutionRunner;
use coderelay::server::{router, AppState};
use coderelay::store::{FileProjectStore, ProjectStore};

#[derive(Parser, Debug)]
#[command(name = "coderelay", about = "Coding-agent execution relay server", version)]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Data directory for the project store (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "coderelay=debug"
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .await
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => RelayConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let store: Arc<dyn ProjectStore> = Arc::new(
        FileProjectStore::new(&config.data_dir)
            .await
            .with_context(|| format!("opening store at {}", config.data_dir.display()))?,
    );
    let broadcaster = Arc::new(Broadcaster::new());
    let adapter = Arc::new(ProcessAdapter::new(config.adapter.clone()));
    let runner = Arc::new(ExecutionRunner::new(
        store.clone(),
        broadcaster.clone(),
        adapter,
        config.clone(),
    ));

    let state = Arc::new(AppState {
        store,
        broadcaster,
        runner,
        config: config.clone(),
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, agent = %config.adapter.cli_type, "relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
