//! Scheduler administration.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    gateway::{authn::require_admin, error::ApiError, state::AppState},
    scheduler::{TaskPatch, task_view},
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/schedule", get(list_tasks).post(create_task))
        .route(
            "/admin/schedule/{id}",
            get(get_task).patch(patch_task).delete(delete_task),
        )
        .route("/admin/schedule/{id}/trigger", post(trigger_task))
        .route("/admin/schedule/{id}/history", get(task_history))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let tasks: Vec<Value> = state.scheduler.list_tasks().iter().map(task_view).collect();
    Ok(Json(json!({ "tasks": tasks })))
}

#[derive(Debug, Deserialize)]
struct CreateTaskBody {
    name: String,
    tool: String,
    #[serde(default)]
    args: Value,
    interval_seconds: u64,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.scheduler.add_task(
        &body.name,
        &body.tool,
        body.args,
        body.interval_seconds,
        body.enabled,
    );
    state.audit.record(
        "schedule_create",
        Some(&admin.username),
        json!({ "name": body.name, "tool": body.tool, "ok": result.is_ok() }),
    );
    let task = result.map_err(|err| ApiError::bad_request(json!(err.to_string())))?;
    Ok(Json(task_view(&task)))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .scheduler
        .get_task(&id)
        .map(|t| Json(task_view(&t)))
        .ok_or_else(|| ApiError::not_found("task not found"))
}

async fn patch_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.scheduler.update_task(&id, patch);
    state.audit.record(
        "schedule_update",
        Some(&admin.username),
        json!({ "id": id, "ok": matches!(result, Ok(Some(_))) }),
    );
    match result {
        Ok(Some(task)) => Ok(Json(task_view(&task))),
        Ok(None) => Err(ApiError::not_found("task not found")),
        Err(err) => Err(ApiError::bad_request(json!(err.to_string()))),
    }
}

async fn delete_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let deleted = state.scheduler.delete_task(&id);
    state.audit.record(
        "schedule_delete",
        Some(&admin.username),
        json!({ "id": id, "ok": deleted }),
    );
    if deleted {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(ApiError::not_found("task not found"))
    }
}

async fn trigger_task(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let triggered = state.scheduler.trigger_task(&id);
    state.audit.record(
        "schedule_trigger",
        Some(&admin.username),
        json!({ "id": id, "ok": triggered }),
    );
    if triggered {
        Ok(Json(json!({ "triggered": id })))
    } else {
        Err(ApiError::not_found("task not found"))
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

async fn task_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .scheduler
        .history(&id, query.limit)
        .map(|records| Json(json!({ "task_id": id, "history": records })))
        .ok_or_else(|| ApiError::not_found("task not found"))
}
