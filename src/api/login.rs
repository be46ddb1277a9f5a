use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::error;

use super::{new_prefix, AppState};
use crate::worker::login::{QrCodeTask, QrScanStatus, QrSlot};

/// Paths a handshake prefix maps to under the states directory
pub fn qrcode_task_for(states_dir: &FsPath, prefix: &str) -> QrCodeTask {
    QrCodeTask::new(
        states_dir.join(format!("{prefix}.qrcode.png")),
        states_dir.join(format!("{prefix}.state.json")),
    )
}

#[derive(Debug, Serialize)]
pub struct QrCodeResponse {
    pub qrcode: String,
}

#[derive(Debug, Serialize)]
pub struct ScanStatusResponse {
    pub status: QrScanStatus,
}

#[derive(Debug, Serialize)]
pub struct QrCodeInfo {
    pub qrcode_path: String,
    pub state_path: String,
}

#[derive(Debug, Deserialize)]
pub struct QrCodeQuery {
    /// Seconds to wait for the worker to produce the image
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    10
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/qrcode/new", get(new_qrcode))
        .route("/qrcode/:prefix", get(fetch_qrcode))
        .route("/qrcode/:prefix/info", get(qrcode_info))
        .route("/qrcode/:prefix/scan_status", get(scan_status))
        .route("/state/:prefix", get(fetch_state))
        .route("/state/:prefix/use", post(use_state))
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    error!("Control surface store failure: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// `GET /zhi/login/qrcode/new` — issue a new handshake
async fn new_qrcode(State(state): State<AppState>) -> Result<Json<QrCodeResponse>, StatusCode> {
    let prefix = new_prefix();
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);

    let slot = QrSlot::new(state.ctx.store.clone());
    slot.create_task(&task).await.map_err(internal)?;

    Ok(Json(QrCodeResponse { qrcode: prefix }))
}

/// `GET /zhi/login/qrcode/{prefix}?timeout=N` — the QR image, once produced
async fn fetch_qrcode(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
    Query(query): Query<QrCodeQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);

    let deadline = Instant::now() + Duration::from_secs(query.timeout);
    while Instant::now() < deadline {
        if task.qrcode_path.exists() {
            let bytes = tokio::fs::read(&task.qrcode_path)
                .await
                .map_err(internal)?;
            return Ok(([(header::CONTENT_TYPE, "image/png")], bytes));
        }
        sleep(Duration::from_millis(200)).await;
    }

    Err(StatusCode::NOT_FOUND)
}

/// `GET /zhi/login/qrcode/{prefix}/info` — where the artifacts land
async fn qrcode_info(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Json<QrCodeInfo> {
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);
    Json(QrCodeInfo {
        qrcode_path: task.qrcode_path.display().to_string(),
        state_path: task.state_path.display().to_string(),
    })
}

/// `GET /zhi/login/qrcode/{prefix}/scan_status`
async fn scan_status(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<Json<ScanStatusResponse>, StatusCode> {
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);
    let slot = QrSlot::new(state.ctx.store.clone());
    let status = slot.status(&task.task_name()).await.map_err(internal)?;
    Ok(Json(ScanStatusResponse { status }))
}

/// `GET /zhi/login/state/{prefix}` — the resulting session-state artifact
async fn fetch_state(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);
    if !task.state_path.exists() {
        return Err(StatusCode::NOT_FOUND);
    }
    let contents = tokio::fs::read_to_string(&task.state_path)
        .await
        .map_err(internal)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], contents))
}

/// `POST /zhi/login/state/{prefix}/use` — bind the artifact as active
async fn use_state(
    State(state): State<AppState>,
    Path(prefix): Path<String>,
) -> Result<String, StatusCode> {
    let task = qrcode_task_for(&state.ctx.config.states_dir, &prefix);
    state
        .ctx
        .set_state_path(&task.state_path.display().to_string())
        .await
        .map_err(internal)?;

    let active = state.ctx.state_path().await.map_err(internal)?;
    Ok(active.display().to_string())
}
