pub mod api;
pub mod config;
pub mod error;
pub mod judge;
pub mod metrics;
pub mod models;
pub mod sandbox;
pub mod verdict;
pub mod workspace;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::routes, config::EngineConfig, judge::Judge, metrics::MetricsRegistry,
    sandbox::{ProcessRunner, RlimitProcessRunner},
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let metrics = Arc::new(MetricsRegistry::new());
    let runner = Arc::new(RlimitProcessRunner::new(
        config.watchdog_poll,
        metrics.clone(),
    ));
    let runner_name = runner.name();
    let judge = Arc::new(Judge::new(&config, runner, metrics.clone()));

    let purged = judge
        .workspaces()
        .purge_stale()
        .await
        .context("workspace root sweep failed")?;
    if purged > 0 {
        tracing::warn!(purged, root = %config.workspace_root.display(), "removed stale workspaces");
    }

    let app: Router = routes(judge, metrics);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(
        bind = %local,
        runner = runner_name,
        workspace_root = %config.workspace_root.display(),
        memory_enforcement = ?config.memory_enforcement,
        "judge ready"
    );
    axum::serve(listener, app).await.context("judge server error")?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(false)
        .with_span_list(false)
        .init();
}
