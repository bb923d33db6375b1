//! JSON API for the importer: status, manual and secured triggers, liveness.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pfs_core::SyncSummary;
use pfs_sync::{Scheduler, SyncError};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "pfs-web";

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    /// Bearer token the cron trigger must present. `None` refuses every call.
    pub trigger_secret: Option<String>,
    pub ping_message: String,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            trigger_secret: None,
            ping_message: "ping".to_string(),
        }
    }

    pub fn with_trigger_secret(mut self, secret: Option<String>) -> Self {
        self.trigger_secret = secret;
        self
    }

    pub fn with_ping_message(mut self, message: impl Into<String>) -> Self {
        self.ping_message = message.into();
        self
    }
}

/// Envelope shared by every importer route.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<SyncSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: &str, status: T) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            status: Some(status),
            summary: None,
            error: None,
        }
    }
}

fn failure(code: StatusCode, message: &str, error: impl ToString) -> Response {
    let body = ApiResponse::<()> {
        success: false,
        message: message.to_string(),
        status: None,
        summary: None,
        error: Some(error.to_string()),
    };
    (code, Json(body)).into_response()
}

fn already_running() -> Response {
    failure(
        StatusCode::CONFLICT,
        "Import is already running",
        "An import process is already in progress",
    )
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    Router::new()
        .route("/api/ping", get(ping_handler))
        .route("/api/import/status", get(status_handler))
        .route("/api/import/run", post(run_handler))
        .route("/api/import/schedule", get(schedule_handler))
        .route("/api/cron/import", get(cron_handler).post(cron_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PFS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "http server listening");
    axum::serve(listener, app(state)).await.context("serving http")?;
    Ok(())
}

async fn ping_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "message": state.ping_message })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let status = state.scheduler.status().await;
    Json(ApiResponse::ok("Import status retrieved", status)).into_response()
}

async fn schedule_handler(State(state): State<Arc<AppState>>) -> Response {
    let schedule = state.scheduler.schedule().await;
    Json(ApiResponse::ok("Schedule information retrieved", schedule)).into_response()
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.run_now().await {
        Ok(status) => Json(ApiResponse::ok("Import started successfully", status)).into_response(),
        Err(SyncError::AlreadyRunning) => already_running(),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to start import", err),
    }
}

async fn cron_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let authorized = match (&state.trigger_secret, bearer_token(&headers)) {
        (Some(secret), Some(token)) => secret_matches(secret, token),
        _ => false,
    };
    if !authorized {
        warn!("rejected cron trigger with missing or invalid secret");
        return failure(StatusCode::UNAUTHORIZED, "Unauthorized", "Invalid cron secret");
    }

    info!("cron import triggered");
    let orchestrator = state.scheduler.orchestrator();
    let guard = match orchestrator.begin().await {
        Ok(guard) => guard,
        Err(SyncError::AlreadyRunning) => return already_running(),
        Err(err) => return failure(StatusCode::INTERNAL_SERVER_ERROR, "Import failed", err),
    };
    // A client hanging up must not abort the run.
    match orchestrator.run_detached(guard).await {
        Ok(summary) => {
            let mut body = ApiResponse::ok(
                "Import completed successfully",
                state.scheduler.status().await,
            );
            body.summary = Some(summary);
            Json(body).into_response()
        }
        Err(SyncError::AlreadyRunning) => already_running(),
        Err(err) => failure(StatusCode::INTERNAL_SERVER_ERROR, "Import failed", err),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

// Digests have a fixed length, so the comparison does not leak the secret's.
fn secret_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.trim().as_bytes())
}
