//! HTTP surface assembly.

pub mod admin;
pub mod approvals;
pub mod auth;
pub mod chat;
pub mod memory;
pub mod providers;
pub mod schedule;
pub mod tools;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use super::{authn::require_admin, error::ApiError, state::AppState};

/// Build the full router with CORS and tracing layers applied.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    Router::new()
        .route("/health", get(health))
        .route("/health/worker", get(health_worker))
        .route("/metrics", get(metrics_endpoint))
        .route("/admin/status", get(admin_status))
        .route("/admin/metrics/tools", get(metrics_tools))
        .merge(tools::router())
        .merge(approvals::router())
        .merge(chat::router())
        .merge(admin::router())
        .merge(webhooks::router())
        .merge(providers::router())
        .merge(memory::router())
        .merge(auth::router())
        .merge(schedule::router())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(list))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

// ─── Health & metrics ────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn health_worker(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "worker_healthy": state.worker_probe.check_health() }))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::gauge!("worker_healthy")
        .set(if state.worker_probe.check_health() { 1.0 } else { 0.0 });
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.telemetry.render(),
    )
}

/// Per-tool invocation counts and latency summary.  Admin only.
async fn metrics_tools(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let (tools, total) = state.tool_stats.summary();
    Ok(Json(json!({ "tools": tools, "total": total })))
}

/// High-level operational summary.  Admin only.
async fn admin_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let kill_active = state.kill_switch.is_active();
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (state.uptime_seconds() * 10.0).round() / 10.0,
        "kill_switch_active": kill_active,
        "kill_switch_reason": kill_active.then(|| state.kill_switch.reason()),
        "tool_calls_total": state.tool_stats.total_calls(),
        "pending_approvals": state.supervisor.queue.pending_count(),
        "scheduler_tasks": state.scheduler.list_tasks().len(),
        "memory_agents": state.agent_memory.list_agents().len(),
    })))
}
