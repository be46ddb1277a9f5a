use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::error;

use super::login::qrcode_task_for;
use super::{known_worker, new_prefix, AppState};
use crate::worker::config::ConfigSynchronizer;
use crate::worker::{configs_key, Archiver, LoginWorker, Monitor, Worker};

#[derive(Debug, Serialize)]
pub struct WorkerStatus {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatePath {
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PauseStatus {
    pub pause: bool,
}

#[derive(Debug, Deserialize)]
pub struct NewStateQuery {
    pub state: String,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/state_path", get(get_state_path).put(set_state_path))
        .route("/states", post(new_state))
        .route("/:name/pause", get(pause_status).put(set_pause))
        .route("/:name/status", get(worker_status))
        .route("/:name/configs", get(get_configs).put(set_configs))
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    error!("Control surface store failure: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

/// `GET /zhi/core/state_path` — the active session-state path
async fn get_state_path(State(state): State<AppState>) -> Result<Json<StatePath>, StatusCode> {
    let path = state.ctx.state_path().await.map_err(internal)?;
    Ok(Json(StatePath {
        path: path.display().to_string(),
    }))
}

/// `PUT /zhi/core/state_path` — override the active session-state path
async fn set_state_path(
    State(state): State<AppState>,
    Json(body): Json<StatePath>,
) -> Result<Json<StatePath>, StatusCode> {
    state.ctx.set_state_path(&body.path).await.map_err(internal)?;
    get_state_path(State(state)).await
}

/// `POST /zhi/core/states?state=<json>` — materialize an ad-hoc state artifact
async fn new_state(
    State(state): State<AppState>,
    Query(query): Query<NewStateQuery>,
) -> Result<Json<StatePath>, (StatusCode, String)> {
    if serde_json::from_str::<Value>(&query.state).is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            "String must be json-serializable".to_string(),
        ));
    }

    let task = qrcode_task_for(&state.ctx.config.states_dir, &new_prefix());
    if let Some(parent) = task.state_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| (internal(e), String::new()))?;
    }
    tokio::fs::write(&task.state_path, &query.state)
        .await
        .map_err(|e| (internal(e), String::new()))?;

    Ok(Json(StatePath {
        path: task.state_path.display().to_string(),
    }))
}

/// `GET /zhi/core/{worker}/pause`
async fn pause_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PauseStatus>, StatusCode> {
    if !known_worker(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let pause = state.ctx.need_pause(&name).await.map_err(internal)?;
    Ok(Json(PauseStatus { pause }))
}

/// `PUT /zhi/core/{worker}/pause`
async fn set_pause(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PauseStatus>,
) -> Result<Json<PauseStatus>, StatusCode> {
    if !known_worker(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    if body.pause {
        state.ctx.pause(&name).await.map_err(internal)?;
    } else {
        state.ctx.resume(&name).await.map_err(internal)?;
    }
    pause_status(State(state), Path(name)).await
}

/// `GET /zhi/core/{worker}/status` — observational run state
async fn worker_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<WorkerStatus>, StatusCode> {
    if !known_worker(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let status = state.ctx.get_status(&name).await.map_err(internal)?;
    Ok(Json(WorkerStatus {
        status: status.as_str().to_string(),
    }))
}

/// `GET /zhi/core/{worker}/configs` — the stored config blob
async fn get_configs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Map<String, Value>>, StatusCode> {
    if !known_worker(&name) {
        return Err(StatusCode::NOT_FOUND);
    }
    let sync = ConfigSynchronizer::new(state.ctx.store.clone(), configs_key(&name));
    let stored = sync.stored().await.map_err(internal)?;
    Ok(Json(stored))
}

/// Converge the stored blob into a fresh instance, then apply the update
///
/// Loading first keeps store-persisted values (like the crawl checkpoint)
/// from being clobbered by the fresh instance's defaults.
async fn apply_to<W: Worker + 'static>(
    mut worker: W,
    partial: &Map<String, Value>,
) -> anyhow::Result<Map<String, Value>> {
    let ctx = worker.context();
    let sync = ConfigSynchronizer::new(ctx.store.clone(), configs_key(worker.name()));
    sync.load(&mut worker).await?;
    sync.apply_external_update(&mut worker, partial).await
}

/// `PUT /zhi/core/{worker}/configs` — apply mutable fields, return accepted
async fn set_configs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(partial): Json<Map<String, Value>>,
) -> Result<Json<Map<String, Value>>, (StatusCode, String)> {
    let ctx = state.ctx.clone();
    let accepted = match name.as_str() {
        "monitor" => apply_to(Monitor::new(ctx), &partial).await,
        "archiver" => apply_to(Archiver::new(ctx), &partial).await,
        "login" => apply_to(LoginWorker::new(ctx), &partial).await,
        _ => return Err((StatusCode::NOT_FOUND, String::new())),
    };

    match accepted {
        Ok(accepted) => Ok(Json(accepted)),
        // A present-but-unparseable value is a caller mistake, not ours
        Err(e) => Err((StatusCode::BAD_REQUEST, format!("{e:#}"))),
    }
}
