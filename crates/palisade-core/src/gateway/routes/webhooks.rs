//! Webhook registry endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    gateway::{authn::require_admin, error::ApiError, state::AppState},
    webhooks::WebhookError,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/webhooks", get(list_webhooks).post(create_webhook))
        .route("/admin/webhooks/{id}", get(get_webhook).delete(delete_webhook))
        .route("/admin/webhooks/{id}/deliveries", get(get_deliveries))
}

#[derive(Debug, Deserialize)]
struct WebhookCreateBody {
    url: String,
    #[serde(default)]
    events: Option<Vec<String>>,
    #[serde(default)]
    secret: String,
}

async fn create_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<WebhookCreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.webhooks.register(&body.url, body.events, &body.secret);
    state.audit.record(
        "webhook_create",
        Some(&admin.username),
        json!({ "url": body.url, "ok": result.is_ok() }),
    );
    match result {
        Ok(hook) => Ok(Json(hook)),
        Err(err @ WebhookError::BadUrl) => Err(ApiError::bad_request(json!(err.to_string()))),
        Err(err @ WebhookError::UnknownEvents(_)) => {
            Err(ApiError::bad_request(json!(err.to_string())))
        }
    }
}

async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "webhooks": state.webhooks.list() })))
}

async fn get_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .webhooks
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("webhook not found"))
}

async fn delete_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let deleted = state.webhooks.delete(&id);
    state.audit.record(
        "webhook_delete",
        Some(&admin.username),
        json!({ "id": id, "ok": deleted }),
    );
    if deleted {
        Ok(Json(json!({ "deleted": id })))
    } else {
        Err(ApiError::not_found("webhook not found"))
    }
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn get_deliveries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<DeliveriesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    if state.webhooks.get(&id).is_none() {
        return Err(ApiError::not_found("webhook not found"));
    }
    Ok(Json(json!({ "deliveries": state.webhooks.deliveries(&id, query.limit) })))
}
