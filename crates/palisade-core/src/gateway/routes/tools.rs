//! `/validate`, `/tools/call`, and `/tools/capabilities`.

use std::{sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::{
    gateway::{
        authn::{ClientKey, optional_user},
        error::ApiError,
        state::AppState,
    },
    supervisor::ProcessOutcome,
};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/validate", post(validate_payload))
        .route("/tools/call", post(tool_call))
        .route("/tools/capabilities", get(list_capabilities))
}

async fn validate_payload(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    state.rate_limiter.check_client(&client.0)?;
    state
        .supervisor
        .validate_only(&payload)
        .map_err(|msg| ApiError::bad_request(json!(format!("schema validation failed: {msg}"))))?;
    Ok(Json(json!({ "valid": true })))
}

async fn tool_call(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    state.rate_limiter.check_client(&client.0)?;

    if state.kill_switch.is_active() {
        return Err(ApiError::kill_switch(&state.kill_switch.reason()));
    }

    // The payload is untrusted; shape enforcement is the supervisor's
    // job.  The tool name is pulled out only for metrics and the
    // per-user allow-list.
    let tool = payload
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    // Per-user scoped quota and tool permissions (anonymous calls pass
    // through to the capability layer).
    if let Some(user) = optional_user(&state, &headers) {
        state.rate_limiter.check_user(&user.username)?;
        if let Some(allowed) = &user.allowed_tools {
            if !allowed.iter().any(|t| t == &tool) {
                metrics::counter!("tool_permission_denied_total", "tool" => tool.clone())
                    .increment(1);
                return Err(ApiError::forbidden(json!({
                    "status": "tool_not_permitted",
                    "tool": tool,
                })));
            }
        }
    }

    metrics::counter!("tool_calls_total", "tool" => tool.clone()).increment(1);

    let started = Instant::now();
    let outcome = state.supervisor.process_call(&payload);
    let elapsed = started.elapsed().as_secs_f64();
    metrics::histogram!("tool_call_duration_seconds", "tool" => tool.clone()).record(elapsed);
    state.tool_stats.observe(&tool, elapsed);

    match outcome {
        ProcessOutcome::ValidationError { .. } => {
            metrics::counter!("tool_validation_errors_total", "tool" => tool.clone()).increment(1);
            state.alert_state.record_validation_error();
            Err(ApiError::bad_request(outcome.to_value()))
        }
        ProcessOutcome::ContentPolicyViolation { .. } => Err(ApiError::forbidden(outcome.to_value())),
        ProcessOutcome::CapabilityDenied { .. } => {
            metrics::counter!("capability_denied_total", "tool" => tool.clone()).increment(1);
            Err(ApiError::forbidden(outcome.to_value()))
        }
        ProcessOutcome::PendingApproval { id, .. } => {
            metrics::counter!("approvals_queued_total").increment(1);
            state
                .webhooks
                .fire("approval.created", json!({"approval_id": id, "tool": tool}));
            queue_depth_alert(&state);
            Ok(Json(json!({ "status": "pending_approval", "id": id })))
        }
        accepted @ ProcessOutcome::Accepted { .. } => Ok(Json(accepted.to_value())),
    }
}

/// Fire `gateway.alert` when the pending count reaches the configured
/// queue-depth threshold (0 disables).
fn queue_depth_alert(state: &AppState) {
    let threshold = state.alert_state.settings().approval_queue_threshold;
    if threshold == 0 {
        return;
    }
    let pending = state.supervisor.queue.pending_count();
    if pending >= threshold {
        state.webhooks.fire(
            "gateway.alert",
            json!({
                "alert": "approval_queue_depth",
                "pending_approvals": pending,
                "threshold": threshold,
            }),
        );
        state.audit.record(
            "alert_fired",
            None,
            json!({
                "alert": "approval_queue_depth",
                "pending": pending,
                "threshold": threshold,
            }),
        );
    }
}

/// List every tool manifest with its declared capabilities.
async fn list_capabilities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tools: Vec<Value> = state
        .manifests
        .list_all()
        .iter()
        .map(|m| {
            json!({
                "tool": m.tool,
                "display_name": m.display_name,
                "description": m.description,
                "required_capabilities": m.required,
                "optional_capabilities": m.optional,
                "risk_level": m.risk_level,
                "requires_approval": m.requires_approval,
                "allowed_arg_keys": m.allowed_arg_keys,
            })
        })
        .collect();
    Json(json!({ "tools": tools }))
}
