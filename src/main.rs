use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use flowgate::{
    changelog::Command,
    config,
    observability::{init_observability, log_config_info},
    proxy::{DataPlane, RouterOptions},
    state::{GatewayState, StateOptions},
    store::Store,
    APP_NAME, VERSION,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "flowgate", version, about = "Distributed HTTP API gateway node")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before any config is read from the environment
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Error loading .env file: {}", e);
        }
    }

    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_observability(&config.observability)?;
    info!(app_name = APP_NAME, version = VERSION, "Starting flowgate node");
    log_config_info(&config);

    let store = Arc::new(Store::from_config(&config).await?);
    let state = GatewayState::new(store, StateOptions::from(&config.node));
    state.start().await.context("failed to start gateway state")?;

    if !config.resources.is_empty() {
        let applied = state.apply_init_resources(&config.resources).await?;
        info!(count = applied, "applied initial resources");
    }

    let shutdown = CancellationToken::new();
    let plane = DataPlane::new(RouterOptions::from(&config));
    let reloader = plane.spawn_reloader(state.clone(), shutdown.clone());

    let bind_address = config.proxy.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind data plane on {}", bind_address))?;
    let server = tokio::spawn(plane.serve(listener, shutdown.clone()));

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("Shutdown signal received");
        }
        command = wait_for_lifecycle(&state) => {
            warn!(command = %command, "lifecycle command received, stopping node");
        }
    }

    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => error!(error = %e, "data plane terminated with error"),
        Err(e) => error!(error = %e, "data plane task failed"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = reloader.await {
        error!(error = %e, "routing table reloader failed");
    }
    state.shutdown().await?;

    info!("flowgate shutdown completed");
    Ok(())
}

/// Resolve once a `shutdown` or `restart` change log has been applied.
async fn wait_for_lifecycle(state: &GatewayState) -> Command {
    let mut lifecycle = state.subscribe_lifecycle();
    loop {
        if let Some(command) = *lifecycle.borrow_and_update() {
            return command;
        }
        if lifecycle.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
