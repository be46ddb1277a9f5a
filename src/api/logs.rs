use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::debug;

use super::{known_worker, AppState};
use crate::utils::logging::log_file_path;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Tail size in KiB
    #[serde(default = "default_size_kb")]
    pub size_kb: u64,
}

fn default_size_kb() -> u64 {
    1000
}

pub fn router() -> Router<AppState> {
    Router::new().route("/:name/logs", get(tail_logs))
}

/// `GET /log/{worker}/logs?size_kb=N` — tail of that worker's log stream
async fn tail_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<String, StatusCode> {
    if !known_worker(&name) {
        return Err(StatusCode::NOT_FOUND);
    }

    let path = log_file_path(&state.ctx.config.logs_dir, &name);
    let contents = tokio::fs::read(&path).await.map_err(|e| {
        debug!("No log sink for {}: {}", name, e);
        StatusCode::NOT_FOUND
    })?;

    let tail_bytes = (query.size_kb as usize).saturating_mul(1024);
    let skip = contents.len().saturating_sub(tail_bytes);
    Ok(String::from_utf8_lossy(&contents[skip..]).into_owned())
}
