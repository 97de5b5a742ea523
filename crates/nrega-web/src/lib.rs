//! HTTP trigger for sync runs plus a read-only view of the run ledger.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use nrega_core::SyncStatus;
use nrega_storage::RunLedger;
use nrega_sync::{pipeline_from_config, SyncConfig, SyncPipeline, SyncRequest};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "nrega-web";

const DEFAULT_RUNS_LIMIT: usize = 20;
const MAX_RUNS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub ledger: Arc<dyn RunLedger>,
    pub sync_secret: Option<String>,
}

impl AppState {
    pub fn new(pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            ledger: pipeline.ledger(),
            sync_secret: pipeline.config().sync_secret.clone(),
            pipeline,
        }
    }

    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.sync_secret = secret;
        self
    }
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sync", post(sync_handler))
        .route("/api/sync/runs", get(runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port = config.web_port;
    if config.sync_secret.is_none() {
        warn!("NREGA_SYNC_SECRET is not set; POST /api/sync will refuse every request");
    }
    let pipeline = Arc::new(pipeline_from_config(config)?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving sync API");
    axum::serve(listener, app(AppState::new(pipeline))).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

async fn sync_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(secret) = state.sync_secret.as_deref() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "sync trigger is not configured");
    };
    let authorized = bearer_token(&headers)
        .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.as_bytes()));
    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    }

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        match serde_json::from_slice::<SyncRequest>(&body) {
            Ok(request) => request,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("invalid request body: {err}"))
            }
        }
    };

    let summary = state.pipeline.run(request).await;
    let status = match summary.status {
        SyncStatus::Error => StatusCode::INTERNAL_SERVER_ERROR,
        SyncStatus::Success | SyncStatus::Partial => StatusCode::OK,
    };
    (status, Json(summary)).into_response()
}

async fn runs_handler(State(state): State<Arc<AppState>>, Query(query): Query<RunsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_RUNS_LIMIT).clamp(1, MAX_RUNS_LIMIT);
    match state.ledger.recent(limit).await {
        Ok(runs) => Json(json!({ "runs": runs })).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
