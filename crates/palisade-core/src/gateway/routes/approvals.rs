//! Approval queue endpoints: list, inspect, decide, and the SSE update
//! stream, plus the in-loop gate's decision endpoints under
//! `/agent/approvals`.

use std::{collections::HashSet, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::gateway::{authn::require_admin, error::ApiError, state::AppState};

/// Queue-poll cadence for the SSE stream.
const SSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/approvals", get(list_approvals))
        .route("/approvals/stream", get(approvals_stream))
        .route("/approvals/{id}", get(get_approval))
        .route("/approvals/{id}/approve", post(approve))
        .route("/approvals/{id}/reject", post(reject))
        .route("/agent/approvals", get(gate_list))
        .route("/agent/approvals/{id}/approve", post(gate_approve))
        .route("/agent/approvals/{id}/deny", post(gate_deny))
}

// ─── Supervisor queue ────────────────────────────────────────────────────────

async fn list_approvals(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "pending": state.supervisor.queue.list_pending() })))
}

async fn get_approval(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .supervisor
        .queue
        .status(id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("request not found"))
}

async fn approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    if !state.supervisor.queue.approve(id) {
        return Err(ApiError::not_found("request not found"));
    }
    state
        .audit
        .record("approve", Some(&admin.username), json!({ "id": id }));
    state
        .webhooks
        .fire("approval.approved", json!({ "approval_id": id }));
    Ok(Json(json!({ "status": "approved", "id": id })))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    if !state.supervisor.queue.reject(id) {
        return Err(ApiError::not_found("request not found"));
    }
    state
        .audit
        .record("reject", Some(&admin.username), json!({ "id": id }));
    state
        .webhooks
        .fire("approval.rejected", json!({ "approval_id": id }));
    Ok(Json(json!({ "status": "rejected", "id": id })))
}

/// SSE stream of queue changes: an `approval_update` event whenever a new
/// pending id appears, with a keepalive comment between polls.
async fn approvals_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
    tokio::spawn(async move {
        let mut known: HashSet<u64> = HashSet::new();
        loop {
            let pending = state.supervisor.queue.list_pending();
            let current: HashSet<u64> = pending.iter().map(|p| p.id).collect();
            if current.difference(&known).next().is_some() {
                let event = Event::default()
                    .event("approval_update")
                    .data(json!({ "pending": pending }).to_string());
                if tx.send(Ok(event)).await.is_err() {
                    break; // client disconnected
                }
                known = current;
            } else if tx.is_closed() {
                break;
            }
            tokio::time::sleep(SSE_POLL_INTERVAL).await;
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)).text("keepalive")))
}

// ─── In-loop approval gate ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GateQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn gate_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<GateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let pending = state.engine.gate.list_pending(query.session_id.as_deref());
    Ok(Json(json!({ "pending": pending })))
}

async fn gate_approve(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    if !state.engine.gate.approve(&id) {
        return Err(ApiError::not_found("approval not found"));
    }
    state
        .audit
        .record("agent_approve", Some(&admin.username), json!({ "id": id }));
    Ok(Json(json!({ "status": "approved", "id": id })))
}

async fn gate_deny(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    if !state.engine.gate.deny(&id) {
        return Err(ApiError::not_found("approval not found"));
    }
    state
        .audit
        .record("agent_deny", Some(&admin.username), json!({ "id": id }));
    Ok(Json(json!({ "status": "denied", "id": id })))
}
