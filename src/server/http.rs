//! Read-only HTTP surface: the dashboard page and JSON views of the store.

use super::actor::ServerHandle;
use crate::error::{AppResult, DaqError};
use crate::experiment::{Step, StepSummary, SweepConfiguration, SweepExport, SweepId, SweepProgress};
use crate::storage::{ClientSessionRecord, Database};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const FALLBACK_INDEX: &str = "<!doctype html>\n<title>cryomag</title>\n<p>cryomag server is running. Connect a dashboard to the event bus.</p>\n";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    db: Database,
    server: ServerHandle,
    index: Arc<str>,
}

impl HttpState {
    /// State serving `index` at `/`.
    pub fn new(db: Database, server: ServerHandle, index: impl Into<Arc<str>>) -> Self {
        Self {
            db,
            server,
            index: index.into(),
        }
    }

    /// Reads the index page once; a built-in page is used if it is missing.
    pub fn with_index_file(db: Database, server: ServerHandle, path: &std::path::Path) -> Self {
        let index = match std::fs::read_to_string(path) {
            Ok(page) => page,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "index page not readable, using built-in page");
                FALLBACK_INDEX.to_string()
            }
        };
        Self::new(db, server, index)
    }
}

/// Errors rendered as JSON.
#[derive(Debug)]
pub enum ApiError {
    /// No such sweep
    NotFound(String),
    /// Anything else
    Internal(DaqError),
}

impl From<DaqError> for ApiError {
    fn from(err: DaqError) -> Self {
        ApiError::Internal(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, what),
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn found<T>(value: Option<T>, sweep_id: i64) -> ApiResult<T> {
    value
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("sweep {sweep_id} not found")))
}

async fn index(State(state): State<HttpState>) -> Html<String> {
    Html(state.index.to_string())
}

async fn progress(State(state): State<HttpState>) -> ApiResult<SweepProgress> {
    Ok(Json(state.db.sweep_progress(None).await?))
}

async fn latest_sweep(State(state): State<HttpState>) -> ApiResult<SweepConfiguration> {
    let config = state.db.latest_sweep().await?.map(|(_, config)| config);
    Ok(Json(config.unwrap_or_default()))
}

async fn active_step(State(state): State<HttpState>) -> ApiResult<Option<Step>> {
    Ok(Json(state.server.active_step().await?))
}

async fn export_sweep(
    State(state): State<HttpState>,
    Path(sweep_id): Path<i64>,
) -> ApiResult<SweepExport> {
    found(state.db.export_sweep(SweepId(sweep_id)).await?, sweep_id)
}

async fn sweep_summary(
    State(state): State<HttpState>,
    Path(sweep_id): Path<i64>,
) -> ApiResult<Vec<StepSummary>> {
    found(state.db.sweep_summary(SweepId(sweep_id)).await?, sweep_id)
}

async fn sessions(State(state): State<HttpState>) -> ApiResult<Vec<ClientSessionRecord>> {
    Ok(Json(state.db.sessions().await?))
}

/// All routes.
pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/progress", get(progress))
        .route("/api/steps/active", get(active_step))
        .route("/api/sweeps/latest", get(latest_sweep))
        .route("/api/sweeps/{id}/export", get(export_sweep))
        .route("/api/sweeps/{id}/summary", get(sweep_summary))
        .route("/api/sessions", get(sessions))
        .with_state(state)
}

/// Serves the routes until the listener fails.
pub async fn serve_http(listener: TcpListener, state: HttpState) -> AppResult<()> {
    info!(addr = %listener.local_addr()?, "http surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
