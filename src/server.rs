//! HTTP server.
//!
//! Exposes the [`ContextService`] operations as a JSON API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health` | Health check (returns version) |
//! | `GET`    | `/context/{project}/{type}?force_rebuild=` | Cached bundle or build status |
//! | `POST`   | `/context/{project}/{type}/build` | Trigger a build (`{"immediate": bool}`) |
//! | `POST`   | `/context/{project}/{type}/cancel` | Cancel a pending build |
//! | `GET`    | `/context/{project}/{type}/status` | Build status and metadata |
//! | `GET`    | `/context/{project}/{type}/overflow?model=` | Overflow report |
//! | `POST`   | `/context/{project}/{type}/selection` | Apply a manual selection (`{"ids": [...], "model": ...}`) |
//! | `DELETE` | `/context/{project}/{type}` | Clear the cached bundle |
//! | `POST`   | `/cleanup` | Purge old entries (`{"max_age_hours": n}`) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "validation error: project must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `timeout` (408),
//! `build_in_progress` (409), `overflow` (422), `upstream` (502).
//!
//! # Background sweep
//!
//! While serving, a task runs [`ContextService::cleanup`] every
//! `cache.cleanup_interval_secs` with `cache.cleanup_max_age_hours`, and
//! fails builds abandoned by other processes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use context_bundler_core::models::ContextBundle;
use context_bundler_core::overflow::OverflowReport;
use context_bundler_core::BundleError;

use crate::config::Config;
use crate::service::{
    BuildStatusReport, ContextResponse, ContextService, GetContextOptions, TriggerOptions,
    TriggerResponse,
};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
struct AppState {
    service: Arc<ContextService>,
    default_max_age_hours: u64,
}

/// Starts the HTTP server on `[server].bind` with a SQLite cache and the
/// filesystem document source. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let service = Arc::new(ContextService::open(config).await?);
    let sweep = spawn_cleanup_sweep(
        service.clone(),
        Duration::from_secs(config.cache.cleanup_interval_secs),
        config.cache.cleanup_max_age_hours,
    );

    let app = router(service, config.cache.cleanup_max_age_hours);
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "server listening");
    println!("Context bundler listening on http://{}", bind_addr);

    let served = axum::serve(listener, app).await;
    sweep.abort();
    served?;
    Ok(())
}

/// Builds the router for `service`. Exposed so embedders and tests can
/// serve their own wiring.
pub fn router(service: Arc<ContextService>, default_max_age_hours: u64) -> Router {
    let state = AppState {
        service,
        default_max_age_hours,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/context/{project}/{document_type}",
            get(handle_get_context).delete(handle_clear),
        )
        .route("/context/{project}/{document_type}/build", post(handle_build))
        .route("/context/{project}/{document_type}/cancel", post(handle_cancel))
        .route("/context/{project}/{document_type}/status", get(handle_status))
        .route(
            "/context/{project}/{document_type}/overflow",
            get(handle_overflow),
        )
        .route(
            "/context/{project}/{document_type}/selection",
            post(handle_selection),
        )
        .route("/cleanup", post(handle_cleanup))
        .layer(cors)
        .with_state(state)
}

/// Periodically purges old entries and fails abandoned builds.
pub fn spawn_cleanup_sweep(
    service: Arc<ContextService>,
    interval: Duration,
    max_age_hours: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.recover_abandoned_builds().await {
                error!(error = %err, "abandoned build recovery failed");
            }
            if let Err(err) = service.cleanup(max_age_hours).await {
                error!(error = %err, "cache cleanup failed");
            }
        }
    })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"not_found"`).
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<BundleError> for AppError {
    fn from(err: BundleError) -> Self {
        let (status, code) = match &err {
            BundleError::Validation { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            BundleError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            BundleError::BuildInProgress { .. } => (StatusCode::CONFLICT, "build_in_progress"),
            BundleError::Timeout { .. } => (StatusCode::REQUEST_TIMEOUT, "timeout"),
            BundleError::Overflow { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "overflow"),
            BundleError::Upstream { .. } => (StatusCode::BAD_GATEWAY, "upstream"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /context/{project}/{type} ============

async fn handle_get_context(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
    Query(options): Query<GetContextOptions>,
) -> Result<Json<ContextResponse>, AppError> {
    let response = state
        .service
        .get_context(&project, &document_type, options)
        .await?;
    Ok(Json(response))
}

async fn handle_build(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
    body: Option<Json<TriggerOptions>>,
) -> Result<Json<TriggerResponse>, AppError> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let response = state
        .service
        .trigger_build(&project, &document_type, options)
        .await?;
    Ok(Json(response))
}

#[derive(Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn handle_cancel(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = state
        .service
        .cancel_build(&project, &document_type)
        .await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn handle_status(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
) -> Result<Json<BuildStatusReport>, AppError> {
    let report = state
        .service
        .get_build_status(&project, &document_type)
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct OverflowQuery {
    #[serde(default)]
    model: Option<String>,
}

async fn handle_overflow(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
    Query(query): Query<OverflowQuery>,
) -> Result<Json<OverflowReport>, AppError> {
    let report = state
        .service
        .check_overflow(&project, &document_type, query.model.as_deref())
        .await?;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SelectionRequest {
    ids: Vec<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn handle_selection(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<ContextBundle>, AppError> {
    let bundle = state
        .service
        .apply_selection(
            &project,
            &document_type,
            &request.ids,
            request.model.as_deref(),
        )
        .await?;
    Ok(Json(bundle))
}

#[derive(Serialize)]
struct ClearResponse {
    cleared: bool,
}

async fn handle_clear(
    State(state): State<AppState>,
    Path((project, document_type)): Path<(String, String)>,
) -> Result<Json<ClearResponse>, AppError> {
    let cleared = state
        .service
        .clear_cache(&project, &document_type)
        .await?;
    Ok(Json(ClearResponse { cleared }))
}

// ============ POST /cleanup ============

#[derive(Deserialize, Default)]
struct CleanupRequest {
    #[serde(default)]
    max_age_hours: Option<u64>,
}

#[derive(Serialize)]
struct CleanupResponse {
    purged: usize,
}

async fn handle_cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupRequest>>,
) -> Result<Json<CleanupResponse>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let max_age_hours = request
        .max_age_hours
        .unwrap_or(state.default_max_age_hours);
    let purged = state.service.cleanup(max_age_hours).await?;
    Ok(Json(CleanupResponse { purged }))
}
