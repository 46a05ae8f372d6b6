//! HTTP API for the payroll pipeline.
//!
//! This module exposes a minimal REST API using the
//! [`axum`](https://crates.io/crates/axum) framework.  It lets an
//! operator or a cron trigger start a month's payroll and lets a
//! dashboard read the queue: per-state counts, failed jobs, and any
//! single job with its per-organisation outcome.

use crate::error::QueueError;
use crate::handler::{trigger_monthly_payroll, PayrollJob};
use crate::queue::{JobId, JobQueue};
use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Application state shared across requests.
pub struct AppState {
    pub queue: JobQueue<PayrollJob>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub year: i32,
    pub month: u32,
}

/// Build the API router around the payroll queue.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/payroll/trigger", post(trigger_handler))
        .route("/api/queue/status", get(status_handler))
        .route("/api/queue/failed", get(failed_handler))
        .route("/api/queue/jobs/:id", get(job_handler))
        .with_state(state)
}

fn error_response(status: StatusCode, message: impl ToString) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

/// Handler for POST /api/payroll/trigger
async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TriggerRequest>,
) -> Response {
    match trigger_monthly_payroll(&state.queue, request.year, request.month).await {
        Ok(id) => (StatusCode::ACCEPTED, Json(json!({ "jobId": id }))).into_response(),
        Err(err @ QueueError::InvalidJob(_)) => error_response(StatusCode::BAD_REQUEST, err),
        Err(err) => error_response(StatusCode::SERVICE_UNAVAILABLE, err),
    }
}

/// Handler for GET /api/queue/status
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let counts = state.queue.counts().await;
    Json(json!({ "queue": state.queue.name(), "counts": counts })).into_response()
}

/// Handler for GET /api/queue/failed
async fn failed_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.queue.failed_jobs().await).into_response()
}

/// Handler for GET /api/queue/jobs/:id
async fn job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.queue.job(JobId(id)).await {
        Some(job) => Json(job).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("job {id} not found")),
    }
}

/// Launch the API server and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
