//! Axum HTTP trigger for SNSM reconciliation runs.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use snsm_sync::{ReconcileSummary, Reconciler, TRIGGER_ACK};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "snsm-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    latest: Arc<Mutex<Option<ReconcileSummary>>>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn latest(&self) -> Option<ReconcileSummary> {
        self.latest.lock().await.clone()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", any(trigger_handler))
        .route("/reports/latest", get(latest_report_handler))
        .route("/healthz", get(health_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> anyhow::Result<u16> {
    match std::env::var("PORT").ok().filter(|v| !v.trim().is_empty()) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("parsing PORT={v}: {err}")),
        None => Ok(8080),
    }
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for merge triggers");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

/// Accepts any method and body. Always answers 200 once both kinds were attempted.
async fn trigger_handler(State(state): State<Arc<AppState>>) -> Response {
    info!("received request to trigger merge");
    let summary = state.reconciler.run_once().await;
    if !summary.all_succeeded() {
        warn!(run_id = %summary.run_id, "merge run finished with failures; see /reports/latest");
    }
    *state.latest.lock().await = Some(summary);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        TRIGGER_ACK,
    )
        .into_response()
}

async fn latest_report_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.latest().await {
        Some(summary) => Json(summary).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no merge run has completed yet"})),
        )
            .into_response(),
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
