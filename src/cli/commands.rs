use anyhow::{Context, Result};
use futures::future::join_all;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::api::{self, AppState};
use crate::cli::config::ArchiveConfig;
use crate::storage::store::RedisStore;
use crate::utils::logging::init_logging;
use crate::worker::{Archiver, LoginWorker, Monitor, WorkerContext, WorkerRuntime};

fn load_config(config_path: Option<&Path>) -> Result<ArchiveConfig> {
    match config_path {
        Some(path) => ArchiveConfig::load_from_file(path),
        None => ArchiveConfig::load_default(),
    }
}

async fn build_context(config: ArchiveConfig) -> Result<Arc<WorkerContext>> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .context("Coordination store is unreachable")?;
    Ok(WorkerContext::new(Arc::new(store), config))
}

/// Run the feed monitor worker
pub async fn monitor(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("monitor", &config.logs_dir, verbose)?;
    info!("Starting zhi-archive v{} monitor", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config).await?;
    WorkerRuntime::new(Monitor::new(ctx)).run().await
}

/// Run the archiver worker
pub async fn archiver(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("archiver", &config.logs_dir, verbose)?;
    info!("Starting zhi-archive v{} archiver", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config).await?;
    WorkerRuntime::new(Archiver::new(ctx)).run().await
}

/// Run the QR-login worker
pub async fn login(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("login", &config.logs_dir, verbose)?;
    info!("Starting zhi-archive v{} login worker", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config).await?;
    WorkerRuntime::new(LoginWorker::new(ctx)).run().await
}

/// Serve the control surface
pub async fn serve(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("api", &config.logs_dir, verbose)?;
    info!("Starting zhi-archive v{} control surface", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config).await?;
    api::serve(AppState::new(ctx)).await
}

/// Run every worker and the control surface in one process
pub async fn all(config_path: Option<&Path>, verbose: bool) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging("all", &config.logs_dir, verbose)?;
    info!("Starting zhi-archive v{} (all workers)", env!("CARGO_PKG_VERSION"));

    let ctx = build_context(config).await?;

    let tasks: Vec<Pin<Box<dyn Future<Output = Result<()>> + Send>>> = vec![
        Box::pin(WorkerRuntime::new(Monitor::new(ctx.clone())).run()),
        Box::pin(WorkerRuntime::new(Archiver::new(ctx.clone())).run()),
        Box::pin(WorkerRuntime::new(LoginWorker::new(ctx.clone())).run()),
        Box::pin(api::serve(AppState::new(ctx.clone()))),
    ];

    // Worker loops never return; this only resolves on a startup failure
    for result in join_all(tasks).await {
        result?;
    }
    Ok(())
}

/// Show the active configuration
pub async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
