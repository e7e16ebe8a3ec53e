//! Axum admin API: trigger clones, poll their status.

use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ftclone_core::{CloneFilters, Stage};
use ftclone_sync::{CloneConfig, CloneError, CloneOrchestrator, CloneRequest, TriggerOutcome};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "ftclone-web";

pub const DEFAULT_WEB_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CloneOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<CloneOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
struct CloneQuery {
    #[serde(default = "unlimited_total")]
    total: i64,
    stages: Option<Stage>,
    #[serde(rename = "updatedFrom")]
    updated_from: Option<String>,
    #[serde(rename = "updatedTo")]
    updated_to: Option<String>,
    #[serde(default)]
    background: bool,
    operation_id: Option<String>,
    #[serde(default)]
    force: bool,
}

fn unlimited_total() -> i64 {
    -1
}

impl From<CloneQuery> for CloneRequest {
    fn from(query: CloneQuery) -> Self {
        Self {
            total: query.total,
            filters: CloneFilters {
                stages: query.stages,
                updated_from: query.updated_from,
                updated_to: query.updated_to,
            },
            operation_id: query.operation_id,
            force: query.force,
            background: query.background,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/admin/clone_database", post(clone_database_handler))
        .route("/admin/clone_status/{operation_id}", get(clone_status_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FTCLONE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_WEB_PORT);
    serve(CloneConfig::from_env(), port).await
}

/// Recover interrupted operations, then serve until ctrl-c.
pub async fn serve(config: CloneConfig, port: u16) -> anyhow::Result<()> {
    let orchestrator = Arc::new(CloneOrchestrator::from_config(config)?);
    let recovered = orchestrator.registry().recover().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), ids = ?recovered, "marked interrupted clones as failed");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, data_dir = %orchestrator.config().data_dir.display(), "admin api listening");
    axum::serve(listener, app(AppState::new(orchestrator)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable");
        std::future::pending::<()>().await;
    }
}

async fn clone_database_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<CloneQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return detail(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };
    match state.orchestrator.trigger(query.into()).await {
        Ok(TriggerOutcome::Finished(result) | TriggerOutcome::AlreadyCompleted(result)) => {
            Json(result).into_response()
        }
        Ok(TriggerOutcome::Queued(queued)) => Json(queued).into_response(),
        Err(err) => clone_error(err),
    }
}

async fn clone_status_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(operation_id): AxumPath<String>,
) -> Response {
    match state.orchestrator.poll(&operation_id).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => clone_error(err),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let registry = state.orchestrator.registry();
    Json(json!({
        "status": "ok",
        "running": registry.running_count().await,
        "max_background": registry.max_background(),
    }))
    .into_response()
}

fn clone_error(err: CloneError) -> Response {
    match err {
        CloneError::NotFound(_) => detail(StatusCode::NOT_FOUND, err.to_string()),
        CloneError::ConcurrencyLimit { .. } => detail(StatusCode::TOO_MANY_REQUESTS, err.to_string()),
        CloneError::AlreadyRunning(_) => detail(StatusCode::CONFLICT, err.to_string()),
        CloneError::InvalidRequest(_) => detail(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()),
        CloneError::Failed { cause, .. } => detail(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Clone failed: {cause}"),
        ),
        CloneError::Storage(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    detail(
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err:#}"),
    )
}

fn detail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "detail": message.into() }))).into_response()
}
