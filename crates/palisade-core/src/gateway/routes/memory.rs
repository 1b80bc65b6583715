//! Agent memory endpoints plus the consent timeline / GDPR surface.

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
    consent::{TimelineQuery, snapshot_inventory},
    gateway::{
        authn::{actor_prefix, bearer_token, require_admin, require_user},
        error::ApiError,
        state::AppState,
    },
    memory::MemoryError,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents", get(list_agents))
        .route("/agents/{id}/memory", get(memory_list).post(memory_set).delete(memory_clear))
        .route("/agents/{id}/memory/prune", post(memory_prune))
        .route("/agents/{id}/memory/{key}", get(memory_get).delete(memory_delete))
        .route("/admin/memory/export", get(memory_export))
        .route("/admin/memory/import", post(memory_import))
        .route("/consent/timeline", get(consent_timeline).delete(consent_clear))
        .route("/consent/log", post(consent_log_share))
        .route("/consent/export/{actor}", get(consent_export).delete(consent_erase))
}

fn map_memory_error(err: MemoryError) -> ApiError {
    match err {
        MemoryError::InvalidAgentId(_) | MemoryError::PathEscape(_) => {
            ApiError::bad_request(json!(err.to_string()))
        }
        MemoryError::Io(_) => ApiError::bad_gateway(err.to_string()),
    }
}

// ─── Agent memory ────────────────────────────────────────────────────────────

async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "agents": state.agent_memory.list_agents() })))
}

async fn memory_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let entries = state.agent_memory.list(&id).map_err(map_memory_error)?;
    Ok(Json(json!({ "agent_id": id, "memory": entries })))
}

#[derive(Debug, Deserialize)]
struct MemoryUpsertBody {
    key: String,
    value: Value,
    #[serde(default)]
    ttl_seconds: Option<f64>,
}

async fn memory_set(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<MemoryUpsertBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .agent_memory
        .set(&id, &body.key, body.value, body.ttl_seconds)
        .map_err(map_memory_error)?;
    Ok(Json(json!({ "agent_id": id, "key": body.key, "stored": true })))
}

async fn memory_get(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let meta = state.agent_memory.get_meta(&id, &key).map_err(map_memory_error)?;
    meta.map(Json).ok_or_else(|| ApiError::not_found("key not found"))
}

async fn memory_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((id, key)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let removed = state.agent_memory.delete(&id, &key).map_err(map_memory_error)?;
    if removed {
        Ok(Json(json!({ "deleted": key })))
    } else {
        Err(ApiError::not_found("key not found"))
    }
}

async fn memory_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let removed = state.agent_memory.clear(&id).map_err(map_memory_error)?;
    state.audit.record(
        "memory_clear",
        Some(&admin.username),
        json!({ "agent_id": id, "removed": removed }),
    );
    Ok(Json(json!({ "agent_id": id, "removed": removed })))
}

async fn memory_prune(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let pruned = state.agent_memory.prune(&id).map_err(map_memory_error)?;
    Ok(Json(json!({ "agent_id": id, "pruned": pruned })))
}

async fn memory_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.audit.record("memory_export", Some(&admin.username), json!({}));
    Ok(Json(state.agent_memory.export_all()))
}

#[derive(Debug, Deserialize)]
struct MemoryImportBody {
    agents: Value,
    #[serde(default = "default_merge")]
    merge: bool,
}

fn default_merge() -> bool {
    true
}

async fn memory_import(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<MemoryImportBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let Some(agents) = body.agents.as_object() else {
        return Err(ApiError::bad_request(json!("agents must be an object")));
    };
    let stats = state
        .agent_memory
        .import_all(agents, body.merge)
        .map_err(map_memory_error)?;
    state.audit.record(
        "memory_import",
        Some(&admin.username),
        serde_json::to_value(stats).unwrap_or_default(),
    );
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ─── Consent timeline & GDPR ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ConsentQuery {
    #[serde(default)]
    origin: String,
    #[serde(default)]
    actor: String,
    #[serde(default = "default_timeline_limit")]
    limit: usize,
}

fn default_timeline_limit() -> usize {
    100
}

async fn consent_timeline(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConsentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let entries = state.consent.timeline(&TimelineQuery {
        origin: (!query.origin.is_empty()).then(|| query.origin.clone()),
        actor: (!query.actor.is_empty()).then(|| query.actor.clone()),
        limit: query.limit,
    });
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

async fn consent_clear(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConsentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let removed = state
        .consent
        .clear((!query.origin.is_empty()).then_some(query.origin.as_str()));
    state.audit.record(
        "consent_clear",
        Some(&admin.username),
        json!({ "origin": query.origin, "removed": removed }),
    );
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Debug, Deserialize)]
struct ConsentShareBody {
    url: String,
    #[serde(default)]
    origin: String,
    #[serde(default)]
    snapshot: Value,
    #[serde(default)]
    redacted: Vec<String>,
}

/// Record a context-share event.  Only the field-name inventory from the
/// snapshot is persisted; the actor is the caller's token prefix.
async fn consent_log_share(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConsentShareBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_user(&state, &headers)?;
    let actor = bearer_token(&headers).map(|t| actor_prefix(&t)).ok();
    let (fields, selected_len) = snapshot_inventory(&body.snapshot);
    let title = body.snapshot["title"].as_str().unwrap_or_default();
    let entry = state.consent.log_share(
        &body.url,
        &body.origin,
        actor.as_deref(),
        fields,
        body.redacted,
        selected_len,
        title,
    );
    Ok(Json(serde_json::to_value(entry).unwrap_or_default()))
}

/// GDPR Art. 15: the complete record for one actor, oldest first.
async fn consent_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(actor): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let entries = state.consent.export_actor(&actor);
    Ok(Json(json!({ "actor": actor, "count": entries.len(), "entries": entries })))
}

/// GDPR Art. 17: erase all entries for one actor.
async fn consent_erase(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(actor): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let removed = state.consent.erase_actor(&actor);
    state.audit.record(
        "consent_erase",
        Some(&admin.username),
        json!({ "actor": actor, "removed": removed }),
    );
    Ok(Json(json!({ "actor": actor, "removed": removed })))
}
