//! Provider administration: key lifecycle, failover chain, cooldowns.
//!
//! Key material flows in through `PUT .../key` and never flows back out;
//! status endpoints expose rotation metadata only.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{
    gateway::{authn::require_admin, error::ApiError, state::AppState},
    providers::failover::ChainEntry,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/providers", get(list_providers))
        .route("/admin/providers/expiring", get(expiring_keys))
        .route("/admin/providers/{provider}/key", put(set_key).delete(delete_key))
        .route("/admin/providers/{provider}/key/rotate", post(rotate_key))
        .route("/admin/providers/{provider}/key/status", get(key_status))
        .route("/admin/failover/chain", get(get_chain).put(put_chain))
        .route("/admin/failover/cooldowns", get(get_cooldowns))
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let providers: Vec<Value> = state
        .adapters
        .provider_names()
        .into_iter()
        .map(|name| {
            let available = state
                .adapters
                .get(&name)
                .is_some_and(|a| a.is_available());
            json!({
                "provider": name,
                "available": available,
                "key": state.provider_keys.metadata(&name),
            })
        })
        .collect();
    Ok(Json(json!({ "providers": providers })))
}

#[derive(Debug, Deserialize)]
struct SetKeyBody {
    key: String,
    #[serde(default)]
    ttl_days: Option<f64>,
}

async fn set_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(body): Json<SetKeyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    if body.key.trim().is_empty() {
        return Err(ApiError::bad_request(json!("key must not be empty")));
    }
    state.provider_keys.set_key(&provider, body.key.trim(), body.ttl_days);
    state.audit.record(
        "provider_key_set",
        Some(&admin.username),
        json!({ "provider": provider, "ttl_days": body.ttl_days }),
    );
    Ok(Json(json!({ "provider": provider, "key": state.provider_keys.metadata(&provider) })))
}

#[derive(Debug, Deserialize)]
struct RotateKeyBody {
    key: String,
}

async fn rotate_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(body): Json<RotateKeyBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let rotated = state.provider_keys.rotate_key(&provider, body.key.trim());
    state.audit.record(
        "provider_key_rotate",
        Some(&admin.username),
        json!({ "provider": provider, "ok": rotated }),
    );
    if rotated {
        Ok(Json(json!({ "provider": provider, "key": state.provider_keys.metadata(&provider) })))
    } else {
        Err(ApiError::not_found("no key stored for provider"))
    }
}

async fn key_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    state
        .provider_keys
        .metadata(&provider)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("no key stored for provider"))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let deleted = state.provider_keys.delete_key(&provider);
    state.audit.record(
        "provider_key_delete",
        Some(&admin.username),
        json!({ "provider": provider, "ok": deleted }),
    );
    if deleted {
        Ok(Json(json!({ "deleted": provider })))
    } else {
        Err(ApiError::not_found("no key stored for provider"))
    }
}

#[derive(Debug, Deserialize)]
struct ExpiringQuery {
    #[serde(default = "default_within_days")]
    within_days: f64,
}

fn default_within_days() -> f64 {
    7.0
}

async fn expiring_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExpiringQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "expiring": state.provider_keys.list_expiring(query.within_days) })))
}

// ─── Failover chain & cooldowns ──────────────────────────────────────────────

async fn get_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "chain": state.failover.chain() })))
}

async fn put_chain(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(entries): Json<Vec<ChainEntry>>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.failover.set_chain(entries);
    state.audit.record(
        "failover_chain_update",
        Some(&admin.username),
        json!({ "chain": state.failover.chain() }),
    );
    Ok(Json(json!({ "chain": state.failover.chain() })))
}

async fn get_cooldowns(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "cooldowns": state.failover.cooldown_status() })))
}
