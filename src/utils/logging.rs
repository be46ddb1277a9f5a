use anyhow::Result;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Initialize the logging system for one worker process
///
/// Logs go to the console and to `{logs_dir}/{name}.log`. The control
/// surface tails the per-worker file, so the file layer appends across
/// restarts rather than truncating.
pub fn init_logging(name: &str, logs_dir: &Path, verbose: bool) -> Result<()> {
    // Create an environment filter
    let env_filter = if verbose {
        EnvFilter::from_default_env()
            .add_directive("zhi_archive=debug".parse()?)
            .add_directive("warn".parse()?)
    } else {
        EnvFilter::from_default_env()
            .add_directive("zhi_archive=info".parse()?)
            .add_directive("warn".parse()?)
    };

    // Configure the console format
    let fmt_layer = fmt::layer().with_target(true);

    fs::create_dir_all(logs_dir)?;
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(logs_dir, name))?;
    let file_layer = fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Arc::new(file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    Ok(())
}

/// Path of the log file a worker name writes to
pub fn log_file_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(format!("{name}.log"))
}
