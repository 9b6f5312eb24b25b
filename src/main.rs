use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use kubegate_k8s::KubeBackendFactory;

mod config;
mod server;

use config::ServerConfig;
use server::AppState;

/// Kubegate - A remote session gateway for Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "kubegate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let state = AppState::new(&config, Arc::new(KubeBackendFactory));
    let app = server::router(state.clone());

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    tracing::info!(address = %config.listen, "kubegate listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("Server error")?;

    tracing::info!("kubegate stopped");
    Ok(())
}

/// Resolves on Ctrl-C, after stopping every session
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }

    tracing::info!("shutting down");
    state.shutdown();
}
