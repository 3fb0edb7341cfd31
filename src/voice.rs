//! Voice HTTP endpoint: a thin caller of the single-shot worker path.
//!
//! `GET /health` answers unconditionally; `POST /api/run` takes a bearer
//! token and `{input, timeout?}` and resolves on the worker's first
//! streamed result. Bodies are capped at 1 MiB; every other path is 404.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::pool::WorkerPool;

const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Ceiling for caller-supplied timeouts.
const MAX_RUN_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Clone)]
pub struct VoiceState {
    pub pool: Arc<WorkerPool>,
    pub token: String,
    pub default_timeout: Duration,
}

#[derive(Deserialize)]
struct RunRequest {
    input: String,
    /// Milliseconds.
    timeout: Option<u64>,
}

#[derive(Serialize)]
struct RunResponse {
    success: bool,
    result: String,
    #[serde(rename = "durationMs")]
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn app(state: VoiceState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/run", post(run_handler))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}

pub async fn serve(state: VoiceState, port: u16) -> anyhow::Result<()> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Voice endpoint listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn run_handler(
    State(state): State<VoiceState>,
    headers: HeaderMap,
    Json(request): Json<RunRequest>,
) -> (StatusCode, Json<RunResponse>) {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", state.token))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(RunResponse {
                success: false,
                result: String::new(),
                duration_ms: 0,
                error: Some("unauthorized".to_string()),
            }),
        );
    }

    let timeout = request
        .timeout
        .map(Duration::from_millis)
        .unwrap_or(state.default_timeout)
        .min(MAX_RUN_TIMEOUT);

    let started = Instant::now();
    match state.pool.run_detached(&request.input, timeout).await {
        Ok(result) => (
            StatusCode::OK,
            Json(RunResponse {
                success: true,
                result,
                duration_ms: started.elapsed().as_millis() as u64,
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::OK,
            Json(RunResponse {
                success: false,
                result: String::new(),
                duration_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            }),
        ),
    }
}
