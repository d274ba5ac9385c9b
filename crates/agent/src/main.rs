//! Eru agent - per-host workload lifecycle agent
//!
//! Runs on every node, reports workload status and node liveness to the
//! control plane and streams workload logs.

use agent_lib::{
    logs,
    observability::StructuredLogger,
    runtime::{create_runtime, Runtime},
    store::{create_store, Store},
    NodeManager, WorkloadManager,
};
use anyhow::{Context, Result};
use eru_agent::{api, config::AgentConfig};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(nodename = %config.nodename, "Agent configured");

    let runtime = create_runtime(&config.runtime_config()).context("failed to create runtime")?;
    let store = create_store(&config.store_config()).context("failed to create store")?;

    let logger = StructuredLogger::new(config.nodename.clone());
    logger.log_startup(AGENT_VERSION, runtime.name(), &store.identifier());

    let manager = WorkloadManager::new(config.manager_config(), runtime.clone(), store)?;
    let health_registry = manager.health_registry();
    let node = NodeManager::new(
        config.node_config(),
        runtime,
        manager.store().clone(),
        health_registry.clone(),
    );

    let token = CancellationToken::new();

    let app_state = Arc::new(api::AppState::new(health_registry));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, token.child_token()));

    let log_addr = format!("0.0.0.0:{}", config.log_port);
    let log_listener = tokio::net::TcpListener::bind(&log_addr)
        .await
        .with_context(|| format!("failed to bind log server on {}", log_addr))?;
    let log_handle = tokio::spawn(logs::server::serve(
        log_listener,
        manager.broadcaster().clone(),
        token.child_token(),
    ));

    let node_handle = {
        let token = token.child_token();
        tokio::spawn(async move { node.run(token).await })
    };

    let signal_token = token.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(signal) => info!(signal, "Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signals"),
        }
        signal_token.cancel();
    });

    let result = manager.run(token.clone()).await;
    token.cancel();

    if let Err(e) = node_handle.await {
        warn!(error = %e, "Node manager task failed");
    }
    let _ = log_handle.await;
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task failed"),
        Ok(Ok(())) => {}
    }

    match &result {
        Ok(()) => logger.log_shutdown("signal"),
        Err(e) => logger.log_shutdown(&e.to_string()),
    }
    result.map_err(anyhow::Error::from)
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let received = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(received)
}
