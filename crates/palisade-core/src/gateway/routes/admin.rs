//! Admin configuration surface: rate limits, alert thresholds, approval
//! timeout, kill switch, audit export, users, and content-filter rules.
//!
//! Every mutating operation writes an audit entry tagged with the acting
//! admin, whether or not the mutation itself succeeded.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, header},
    response::IntoResponse,
    routing::{delete, get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    audit::AuditFilter,
    config::{AlertSettings, ApprovalSettings},
    filter::RuleMode,
    gateway::{authn::require_admin, error::ApiError, state::AppState},
    ratelimit::RateLimitUpdate,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/rate-limits", get(get_rate_limits).put(put_rate_limits))
        .route("/admin/rate-limits/usage", get(rate_limit_usage))
        .route("/admin/rate-limits/clients/{key}", delete(reset_rate_limit_client))
        .route("/admin/rate-limits/users/{username}", delete(reset_rate_limit_user))
        .route("/admin/alerts/config", get(get_alerts_config).put(put_alerts_config))
        .route("/admin/approvals/config", get(get_approvals_config).put(put_approvals_config))
        .route(
            "/admin/kill-switch",
            get(kill_switch_status).post(kill_switch_activate).delete(kill_switch_deactivate),
        )
        .route("/admin/audit", get(audit_export))
        .route("/admin/audit/export.csv", get(audit_export_csv))
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/{username}", delete(delete_user))
        .route("/admin/users/{username}/password", put(change_password))
        .route(
            "/admin/users/{username}/permissions",
            get(get_user_permissions).put(put_user_permissions),
        )
        .route(
            "/admin/content-filter/rules",
            get(filter_list_rules).post(filter_add_rule),
        )
        .route("/admin/content-filter/rules/{index}", delete(filter_delete_rule))
        .route("/admin/content-filter/reload", post(filter_reload))
}

// ─── Rate limits ─────────────────────────────────────────────────────────────

async fn get_rate_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(serde_json::to_value(state.rate_limiter.config()).unwrap_or_default()))
}

async fn put_rate_limits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<RateLimitUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.rate_limiter.update_config(update);
    state.audit.record(
        "rate_limit_update",
        Some(&admin.username),
        json!({ "ok": result.is_ok() }),
    );
    let settings = result.map_err(|err| ApiError::bad_request(json!(err.to_string())))?;
    Ok(Json(serde_json::to_value(settings).unwrap_or_default()))
}

async fn rate_limit_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let clients = state.rate_limiter.usage_snapshot();
    Ok(Json(json!({ "total_tracked": clients.len(), "clients": clients })))
}

async fn reset_rate_limit_client(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.rate_limiter.reset_client(&key);
    state
        .audit
        .record("rate_limit_reset", Some(&admin.username), json!({ "client": key }));
    Ok(Json(json!({ "reset": true })))
}

async fn reset_rate_limit_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.rate_limiter.reset_user(&username);
    state
        .audit
        .record("rate_limit_reset", Some(&admin.username), json!({ "user": username }));
    Ok(Json(json!({ "reset": true })))
}

// ─── Alert & approval config ─────────────────────────────────────────────────

async fn get_alerts_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(serde_json::to_value(state.alert_state.settings()).unwrap_or_default()))
}

async fn put_alerts_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(settings): Json<AlertSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.alert_state.update_settings(settings.clone());
    state.audit.record(
        "alerts_config_update",
        Some(&admin.username),
        serde_json::to_value(&settings).unwrap_or_default(),
    );
    Ok(Json(serde_json::to_value(settings).unwrap_or_default()))
}

async fn get_approvals_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(serde_json::to_value(state.approval_config.settings()).unwrap_or_default()))
}

async fn put_approvals_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(settings): Json<ApprovalSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    state.approval_config.update(settings.clone());
    state.audit.record(
        "approvals_config_update",
        Some(&admin.username),
        serde_json::to_value(&settings).unwrap_or_default(),
    );
    Ok(Json(serde_json::to_value(settings).unwrap_or_default()))
}

// ─── Kill switch ─────────────────────────────────────────────────────────────

async fn kill_switch_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({
        "active": state.kill_switch.is_active(),
        "reason": state.kill_switch.reason(),
    })))
}

#[derive(Debug, Deserialize)]
struct KillSwitchBody {
    #[serde(default)]
    reason: String,
}

async fn kill_switch_activate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<KillSwitchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let reason = if body.reason.is_empty() {
        "kill-switch activated".to_owned()
    } else {
        body.reason
    };
    state.kill_switch.arm(&reason);
    state.audit.record(
        "kill_switch_activate",
        Some(&admin.username),
        json!({ "reason": reason }),
    );
    Ok(Json(json!({ "active": true, "reason": reason })))
}

async fn kill_switch_deactivate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let previous = state.kill_switch.disarm();
    state.audit.record(
        "kill_switch_deactivate",
        Some(&admin.username),
        json!({ "previous_reason": previous }),
    );
    Ok(Json(json!({ "active": false })))
}

// ─── Audit export ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default)]
    tail: Option<usize>,
    #[serde(default)]
    actor: String,
    #[serde(default)]
    event: String,
    #[serde(default)]
    since: String,
    #[serde(default)]
    until: String,
}

fn parse_bound(raw: &str, name: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    if raw.is_empty() {
        return Ok(None);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| Some(dt.with_timezone(&Utc)))
        .map_err(|_| ApiError::bad_request(json!(format!("Invalid {name} datetime: {raw:?}"))))
}

fn audit_filter(query: &AuditQuery, default_tail: usize) -> Result<AuditFilter, ApiError> {
    Ok(AuditFilter {
        tail: query.tail.unwrap_or(default_tail),
        actor: (!query.actor.is_empty()).then(|| query.actor.clone()),
        event: (!query.event.is_empty()).then(|| query.event.clone()),
        since: parse_bound(&query.since, "since")?,
        until: parse_bound(&query.until, "until")?,
    })
}

async fn audit_export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let entries = state.audit.export(&audit_filter(&query, 200)?);
    Ok(Json(json!({ "count": entries.len(), "entries": entries })))
}

async fn audit_export_csv(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    let csv = state.audit.export_csv(&audit_filter(&query, 1000)?);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"audit.csv\"",
            ),
        ],
        csv,
    ))
}

// ─── Users ───────────────────────────────────────────────────────────────────

async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({ "users": state.auth.list_users() })))
}

#[derive(Debug, Deserialize)]
struct CreateUserBody {
    username: String,
    password: String,
    #[serde(default)]
    roles: Vec<String>,
}

async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateUserBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let roles = if body.roles.is_empty() { vec!["user".to_owned()] } else { body.roles };
    let created = state.auth.create_user(&body.username, &body.password, &roles);
    state.audit.record(
        "user_create",
        Some(&admin.username),
        json!({ "username": body.username, "ok": created }),
    );
    if created {
        Ok(Json(json!({ "created": body.username, "roles": roles })))
    } else {
        Err(ApiError::bad_request(json!("user already exists")))
    }
}

async fn delete_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let deleted = state.auth.delete_user(&username);
    state.audit.record(
        "user_delete",
        Some(&admin.username),
        json!({ "username": username, "ok": deleted }),
    );
    if deleted {
        Ok(Json(json!({ "deleted": username })))
    } else {
        Err(ApiError::not_found("user not found or protected"))
    }
}

#[derive(Debug, Deserialize)]
struct ChangePasswordBody {
    password: String,
}

async fn change_password(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(body): Json<ChangePasswordBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let changed = state.auth.change_password(&username, &body.password);
    state.audit.record(
        "user_password_change",
        Some(&admin.username),
        json!({ "username": username, "ok": changed }),
    );
    if changed {
        Ok(Json(json!({ "changed": username })))
    } else {
        Err(ApiError::not_found("user not found"))
    }
}

async fn get_user_permissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({
        "username": username,
        "allowed_tools": state.auth.allowed_tools(&username),
    })))
}

#[derive(Debug, Deserialize)]
struct PermissionsBody {
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
}

async fn put_user_permissions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(username): Path<String>,
    Json(body): Json<PermissionsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let ok = state.auth.set_allowed_tools(&username, body.allowed_tools.clone());
    state.audit.record(
        "user_permissions_update",
        Some(&admin.username),
        json!({ "username": username, "allowed_tools": body.allowed_tools, "ok": ok }),
    );
    if ok {
        Ok(Json(json!({
            "username": username,
            "allowed_tools": state.auth.allowed_tools(&username),
        })))
    } else {
        Err(ApiError::not_found("user not found"))
    }
}

// ─── Content filter rules ────────────────────────────────────────────────────

async fn filter_list_rules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(json!({
        "rules": state.filter.rules(),
        "active_patterns": state.filter.active_count(),
    })))
}

#[derive(Debug, Deserialize)]
struct FilterRuleBody {
    pattern: String,
    #[serde(default)]
    mode: RuleMode,
    #[serde(default)]
    label: String,
}

async fn filter_add_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<FilterRuleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.filter.add_rule(&body.pattern, body.mode, &body.label);
    state.audit.record(
        "content_filter_rule_add",
        Some(&admin.username),
        json!({ "pattern": body.pattern, "ok": result.is_ok() }),
    );
    result.map_err(|err| ApiError::bad_request(json!(err.to_string())))?;
    Ok(Json(json!({ "rules": state.filter.rules() })))
}

async fn filter_delete_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(index): Path<usize>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let result = state.filter.delete_rule(index);
    state.audit.record(
        "content_filter_rule_delete",
        Some(&admin.username),
        json!({ "index": index, "ok": result.is_ok() }),
    );
    result.map_err(|_| ApiError::not_found("rule index out of range"))?;
    Ok(Json(json!({ "rules": state.filter.rules() })))
}

async fn filter_reload(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let count = state.filter.reload();
    state.supervisor.reload_tool_schemas();
    state.manifests.reload();
    state.audit.record(
        "content_filter_reload",
        Some(&admin.username),
        json!({ "active_patterns": count }),
    );
    Ok(Json(json!({ "active_patterns": count })))
}
