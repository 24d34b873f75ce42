//! HTTP surface (spec.md §4, "out of scope: dashboard query endpoints").
//! `/health` and `/ready` are the ambient ops surface kept regardless of
//! that non-goal, the same way logging is kept regardless of the "no UI"
//! non-goal. `/webhook/:server_id` is not a dashboard endpoint — it's the
//! inbound half of the Push Processor (spec.md §4.C9), which has to land
//! somewhere on the HTTP surface to ever receive a payload. Deliberately
//! does not reproduce the teacher's dashboard routes (`/assets`,
//! `/analytics/...`, `/replay/...`).
//!
//! Grounded on `server::run_server`/`routes::create_router`'s shape: a
//! `Router` built from shared state, CORS and trace middleware, served
//! off a `TcpListener`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cache::CacheBackend;
use crate::models::ServerId;
use crate::push_processor::PushProcessor;

/// State shared by the HTTP handlers. Readiness additionally checks that
/// the cache backend answers; the webhook route looks up the processor
/// registered for the server the path names.
pub struct ApiState {
    cache: Arc<dyn CacheBackend>,
    push_processors: HashMap<ServerId, Arc<PushProcessor>>,
}

impl ApiState {
    pub fn new(cache: Arc<dyn CacheBackend>, push_processors: HashMap<ServerId, Arc<PushProcessor>>) -> Self {
        ApiState { cache, push_processors }
    }
}

/// Liveness — the process is up and can serve HTTP.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness — the cache backend is reachable. Does not check Postgres;
/// a degraded store still lets the process serve cached reads.
async fn ready(State(state): State<Arc<ApiState>>) -> (axum::http::StatusCode, Json<Value>) {
    match state.cache.active_session_ids().await {
        Ok(_) => (axum::http::StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "error": e.to_string() })),
        ),
    }
}

/// Receives an inbound webhook for the server named in the path, looks up
/// its registered [`PushProcessor`], and hands the raw body over
/// (spec.md §4.C9). 404 if no push-capable adapter is registered for that
/// server; 400 if the processor rejects the payload.
async fn webhook(
    State(state): State<Arc<ApiState>>,
    Path(server_id): Path<Uuid>,
    body: axum::body::Bytes,
) -> axum::http::StatusCode {
    let Some(processor) = state.push_processors.get(&ServerId(server_id)) else {
        return axum::http::StatusCode::NOT_FOUND;
    };

    match processor.handle_webhook(&body).await {
        Ok(_) => axum::http::StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "webhook rejected");
            axum::http::StatusCode::BAD_REQUEST
        }
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/webhook/:server_id", post(webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Binds and serves the health/readiness app until the listener errors.
pub async fn run(host: &str, port: u16, state: Arc<ApiState>) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "health server listening");
    axum::serve(listener, app).await
}
