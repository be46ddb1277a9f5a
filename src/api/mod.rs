pub mod auth;
pub mod core;
pub mod logs;
pub mod login;

// Re-export common types
pub use auth::JwtService;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{middleware, Router};
use rand::RngCore;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::worker::WorkerContext;

/// Worker names the control surface will address
pub const WORKER_NAMES: &[&str] = &["monitor", "archiver", "login"];

pub fn known_worker(name: &str) -> bool {
    WORKER_NAMES.contains(&name)
}

/// Fresh opaque prefix for handshake identifiers and ad-hoc state files
pub fn new_prefix() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Shared state for every control-surface handler
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<WorkerContext>,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        let jwt = JwtService::new(&ctx.config.api.jwt_secret);
        Self { ctx, jwt }
    }
}

async fn index() -> &'static str {
    "zhi-archive control surface"
}

/// Build the control-surface router
///
/// Everything except `/` and `POST /auth/login` sits behind the cookie
/// credential.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .nest("/log", logs::router())
        .nest(
            "/zhi",
            Router::new()
                .nest("/core", core::router())
                .nest("/login", login::router()),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/", get(index))
        .route("/auth/login", post(auth::login))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control surface until the process is terminated
pub async fn serve(state: AppState) -> Result<()> {
    let bind_addr = state.ctx.config.api.bind_addr.clone();
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .context(format!("Failed to bind control surface to {}", bind_addr))?;
    info!("Control surface listening on {}", bind_addr);

    axum::serve(listener, router)
        .await
        .context("Control surface exited")
}
