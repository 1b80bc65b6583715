//! End-to-end tests over the assembled router (no sockets, no network).

use std::{path::Path, sync::Arc};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use palisade_core::{
    config::{GatewayConfig, RateLimitSettings},
    gateway::{AppState, build_router},
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestGateway {
    _dir: TempDir,
    state: Arc<AppState>,
    router: Router,
}

fn write_manifest(state_dir: &Path, rel: &str, body: Value) {
    let path = state_dir.join("manifests").join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body.to_string()).unwrap();
}

fn gateway_with(configure: impl FnOnce(&mut GatewayConfig)) -> TestGateway {
    let dir = TempDir::new().unwrap();
    let mut config = GatewayConfig {
        state_dir: dir.path().to_path_buf(),
        allowed_caps: Some("fs.read,browser.dom".to_owned()),
        rate_limit: RateLimitSettings {
            enabled: true,
            max_requests: 10_000,
            window_seconds: 60.0,
            burst: 0,
            user_max_requests: 10_000,
            user_window_seconds: 60.0,
        },
        ..GatewayConfig::default()
    };
    write_manifest(dir.path(), "file/read.json", json!({
        "tool": "file.read",
        "required": ["fs.read"],
        "risk_level": "medium",
        "requires_approval": false,
    }));
    write_manifest(dir.path(), "file/write.json", json!({
        "tool": "file.write",
        "required": ["fs.write"],
        "risk_level": "high",
        "requires_approval": true,
    }));
    configure(&mut config);
    let state = AppState::from_config(config).expect("state builds");
    let router = build_router(Arc::clone(&state));
    TestGateway { _dir: dir, state, router }
}

fn gateway() -> TestGateway {
    gateway_with(|_| {})
}

async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_bearer(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    request
}

async fn admin_token(gw: &TestGateway) -> String {
    gw.state
        .auth
        .create_user("admin", "correct-horse", &["admin".to_owned()]);
    let (status, body) = call(
        &gw.router,
        post_json("/admin/login", json!({"username": "admin", "password": "correct-horse"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["access_token"].as_str().unwrap().to_owned()
}

// ─── Health & metrics ────────────────────────────────────────────────────────

#[tokio::test]
async fn health_is_public() {
    let gw = gateway();
    let (status, body) = call(&gw.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&gw.router, get("/health/worker")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker_healthy"], true);
}

#[tokio::test]
async fn metrics_renders_prometheus_text() {
    let gw = gateway();
    let response = gw.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn admin_status_requires_admin() {
    let gw = gateway();
    let (status, _) = call(&gw.router, get("/admin/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = admin_token(&gw).await;
    let (status, body) = call(&gw.router, with_bearer(get("/admin/status"), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kill_switch_active"], false);
    assert_eq!(body["pending_approvals"], 0);
}

// ─── Tool-call pipeline ──────────────────────────────────────────────────────

#[tokio::test]
async fn high_risk_heuristic_call_is_queued() {
    let gw = gateway();
    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "system.exec", "args": {"command": "rm -rf /"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_approval");
    assert_eq!(body["id"], 1);
    assert_eq!(gw.state.supervisor.queue.pending_count(), 1);
}

#[tokio::test]
async fn manifest_opt_out_accepts_high_risk_args() {
    let gw = gateway();
    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "file.read", "args": {"path": "../etc/passwd"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["risk"], "high");
    assert_eq!(body["tool"], "file.read");
    assert_eq!(body["args"]["path"], "../etc/passwd");
}

#[tokio::test]
async fn manifest_required_approval_always_queues() {
    let gw = gateway_with(|config| {
        config.allowed_caps = Some("ALL".to_owned());
    });
    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "file.write", "args": {"path": "notes.txt"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_approval");
}

#[tokio::test]
async fn capability_denied_is_403_with_missing_set() {
    let gw = gateway();
    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "file.write", "args": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"]["status"], "capability_denied");
    assert_eq!(body["detail"]["denied_capabilities"][0], "fs.write");
}

#[tokio::test]
async fn schema_violation_is_400_with_deterministic_token() {
    let gw = gateway();
    let bad = json!({"tool": "echo"});
    let (status, first) = call(&gw.router, post_json("/tools/call", bad.clone())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(first["detail"]["status"], "validation_error");
    let (_, second) = call(&gw.router, post_json("/tools/call", bad)).await;
    assert_eq!(first["detail"]["error_token"], second["detail"]["error_token"]);
}

#[tokio::test]
async fn sanitised_args_round_trip_through_accept() {
    let gw = gateway();
    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "echo", "args": {"text": "hi", "password": "pw"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["args"]["password"], "[REDACTED]");
}

#[tokio::test]
async fn per_user_tool_allowlist_blocks_unlisted_tools() {
    let gw = gateway();
    let token = admin_token(&gw).await;
    gw.state
        .auth
        .set_allowed_tools("admin", Some(vec!["echo".to_owned()]));

    let (status, body) = call(
        &gw.router,
        with_bearer(
            post_json("/tools/call", json!({"tool": "file.read", "args": {}})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"]["status"], "tool_not_permitted");
    assert_eq!(body["detail"]["tool"], "file.read");

    let (status, _) = call(
        &gw.router,
        with_bearer(
            post_json("/tools/call", json!({"tool": "echo", "args": {"text": "ok"}})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn validate_endpoint_is_schema_only() {
    let gw = gateway();
    let (status, body) = call(
        &gw.router,
        post_json("/validate", json!({"tool": "anything", "args": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, _) = call(&gw.router, post_json("/validate", json!({"args": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn capabilities_listing_is_public() {
    let gw = gateway();
    let (status, body) = call(&gw.router, get("/tools/capabilities")).await;
    assert_eq!(status, StatusCode::OK);
    let tools = body["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["tool"] == "file.read"));
    assert!(tools.iter().any(|t| t["requires_approval"] == true));
}

// ─── Kill switch ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn kill_switch_blocks_tool_calls_only() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (status, body) = call(
        &gw.router,
        with_bearer(
            post_json("/admin/kill-switch", json!({"reason": "incident drill"})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], true);

    let (status, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "echo", "args": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["detail"]["error"], "gateway kill-switch is active");
    assert_eq!(body["detail"]["reason"], "incident drill");

    // Admin surface stays available while armed.
    let (status, _) = call(&gw.router, with_bearer(get("/admin/status"), &token)).await;
    assert_eq!(status, StatusCode::OK);

    let disarm = Request::builder()
        .method("DELETE")
        .uri("/admin/kill-switch")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&gw.router, with_bearer(disarm, &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    let (status, _) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "echo", "args": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ─── Approvals ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn approval_lifecycle_over_http() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (_, body) = call(
        &gw.router,
        post_json("/tools/call", json!({"tool": "system.exec", "args": {"command": "reboot"}})),
    )
    .await;
    let id = body["id"].as_u64().unwrap();

    let (status, body) = call(&gw.router, with_bearer(get("/approvals"), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"].as_array().unwrap().len(), 1);

    let (status, body) = call(
        &gw.router,
        with_bearer(post_json(&format!("/approvals/{id}/approve"), json!({})), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");

    // Terminal state is visible and sticky.
    let (status, body) =
        call(&gw.router, with_bearer(get(&format!("/approvals/{id}")), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");

    let (status, _) = call(
        &gw.router,
        with_bearer(post_json("/approvals/999/reject", json!({})), &token),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approvals_require_admin() {
    let gw = gateway();
    let (status, _) = call(&gw.router, get("/approvals")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    gw.state.auth.create_user("plain", "pw", &["user".to_owned()]);
    let (_, login) = call(
        &gw.router,
        post_json("/admin/login", json!({"username": "plain", "password": "pw"})),
    )
    .await;
    let user_token = login["access_token"].as_str().unwrap();
    let (status, _) = call(&gw.router, with_bearer(get("/approvals"), user_token)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

#[tokio::test]
async fn per_ip_rate_limit_breaches_with_retry_after() {
    let gw = gateway_with(|config| {
        config.rate_limit = RateLimitSettings {
            enabled: true,
            max_requests: 2,
            window_seconds: 60.0,
            burst: 0,
            user_max_requests: 5,
            user_window_seconds: 60.0,
        };
    });

    let request = |ip: &str| {
        let mut req = post_json("/validate", json!({"tool": "echo", "args": {}}));
        req.headers_mut()
            .insert("x-forwarded-for", ip.parse().unwrap());
        req
    };

    for _ in 0..2 {
        let (status, _) = call(&gw.router, request("10.0.0.1")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let response = gw.router.clone().oneshot(request("10.0.0.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["detail"]["error"], "rate_limit_exceeded");
    assert_eq!(body["detail"]["limit"], 2);

    // A different forwarded IP has its own window.
    let (status, _) = call(&gw.router, request("10.0.0.2")).await;
    assert_eq!(status, StatusCode::OK);
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_requires_bearer() {
    let gw = gateway();
    let (status, _) = call(
        &gw.router,
        post_json("/chat/complete", json!({"provider": "openai", "messages": []})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn chat_content_policy_block_is_403() {
    let gw = gateway();
    let token = admin_token(&gw).await;
    gw.state
        .filter
        .add_rule("DROP TABLE", palisade_core::filter::RuleMode::Literal, "sql-ddl")
        .unwrap();

    let (status, body) = call(
        &gw.router,
        with_bearer(
            post_json("/chat/complete", json!({
                "provider": "openai",
                "messages": [{"role": "user", "content": "drop table users;"}],
            })),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"]["error"], "content_policy_violation");
    assert_eq!(body["detail"]["matched_rule"], "sql-ddl");
    assert_eq!(body["detail"]["pattern"], "DROP TABLE");
}

// ─── Webhooks ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn webhook_crud_hides_secrets() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (status, hook) = call(
        &gw.router,
        with_bearer(
            post_json("/admin/webhooks", json!({
                "url": "https://example.com/hook",
                "events": ["approval.created"],
                "secret": "hmac-secret",
            })),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(hook["signed"], true);
    assert!(hook.get("secret").is_none());
    let id = hook["id"].as_str().unwrap().to_owned();

    let (status, body) = call(
        &gw.router,
        with_bearer(
            post_json("/admin/webhooks", json!({"url": "https://x.example", "events": ["bogus.event"]})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("unknown events"));

    let (status, body) = call(
        &gw.router,
        with_bearer(get(&format!("/admin/webhooks/{id}/deliveries")), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deliveries"].as_array().unwrap().len(), 0);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/admin/webhooks/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&gw.router, with_bearer(delete, &token)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(
        &gw.router,
        with_bearer(get(&format!("/admin/webhooks/{id}")), &token),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ─── Memory & consent ────────────────────────────────────────────────────────

#[tokio::test]
async fn agent_memory_endpoints_roundtrip() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (status, _) = call(
        &gw.router,
        with_bearer(
            post_json("/agents/helper-bot/memory", json!({"key": "mood", "value": "curious"})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(
        &gw.router,
        with_bearer(get("/agents/helper-bot/memory/mood"), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["value"], "curious");

    let (status, body) = call(&gw.router, with_bearer(get("/agents"), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agents"][0], "helper-bot");

    let (status, body) = call(&gw.router, with_bearer(get("/admin/memory/export"), &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["agent_count"], 1);
    assert_eq!(body["agents"]["helper-bot"]["mood"], "curious");

    let (status, _) = call(
        &gw.router,
        with_bearer(post_json("/agents/bad%2Fid/memory", json!({"key": "k", "value": 1})), &token),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn consent_export_and_erasure() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (status, entry) = call(
        &gw.router,
        with_bearer(
            post_json("/consent/log", json!({
                "url": "https://example.com/login",
                "snapshot": {
                    "title": "Login",
                    "inputs": [{"name": "username", "value": "SECRET"}],
                    "selected_text": "hello",
                },
                "redacted": ["password"],
            })),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actor = entry["actor"].as_str().unwrap().to_owned();
    assert_eq!(entry["fields"][0], "username");
    assert_eq!(entry["selected_text_len"], 5);

    let (status, body) = call(
        &gw.router,
        with_bearer(get(&format!("/consent/export/{actor}")), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let erase = Request::builder()
        .method("DELETE")
        .uri(format!("/consent/export/{actor}"))
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&gw.router, with_bearer(erase, &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);
}

// ─── Schedule ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn schedule_crud_and_trigger() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let (status, task) = call(
        &gw.router,
        with_bearer(
            post_json("/admin/schedule", json!({
                "name": "hourly-echo",
                "tool": "echo",
                "args": {"text": "tick"},
                "interval_seconds": 3600,
            })),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = task["id"].as_str().unwrap().to_owned();

    let (status, _) = call(
        &gw.router,
        with_bearer(post_json(&format!("/admin/schedule/{id}/trigger"), json!({})), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    gw.state.scheduler.run_due_tasks();

    let (status, body) = call(
        &gw.router,
        with_bearer(get(&format!("/admin/schedule/{id}/history")), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["history"].as_array().unwrap().len(), 1);
    assert_eq!(body["history"][0]["ok"], true);

    let (status, body) = call(
        &gw.router,
        with_bearer(get(&format!("/admin/schedule/{id}")), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run_count"], 1);
    // The scheduled call went through the supervisor pipeline.
    assert_eq!(body["last_result"]["status"], "accepted");
}

// ─── Audit ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn admin_actions_are_audited_and_exportable() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let _ = call(
        &gw.router,
        with_bearer(post_json("/admin/kill-switch", json!({"reason": "drill"})), &token),
    )
    .await;

    let (status, body) = call(
        &gw.router,
        with_bearer(get("/admin/audit?event=kill_switch"), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["entries"][0]["actor"], "admin");
    assert_eq!(body["entries"][0]["details"]["reason"], "drill");

    let response = gw
        .router
        .clone()
        .oneshot(with_bearer(get("/admin/audit/export.csv"), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let csv = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(csv.starts_with("ts,event,actor,details"));
    assert!(csv.contains("kill_switch_activate"));
}

// ─── Token lifecycle ─────────────────────────────────────────────────────────

#[tokio::test]
async fn refresh_and_revoke_flow() {
    let gw = gateway();
    gw.state.auth.create_user("admin", "pw-long-enough", &["admin".to_owned()]);
    let (_, login) = call(
        &gw.router,
        post_json("/admin/login", json!({"username": "admin", "password": "pw-long-enough"})),
    )
    .await;
    let access = login["access_token"].as_str().unwrap().to_owned();
    let refresh = login["refresh_token"].as_str().unwrap().to_owned();

    let (status, body) = call(
        &gw.router,
        post_json("/admin/refresh", json!({"refresh_token": refresh})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let fresh = body["access_token"].as_str().unwrap().to_owned();

    let (status, _) = call(
        &gw.router,
        with_bearer(post_json("/admin/revoke", json!({"token": access.clone()})), &fresh),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The revoked token no longer authenticates.
    let (status, _) = call(&gw.router, with_bearer(get("/admin/status"), &access)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn first_run_setup_creates_admin_once() {
    let gw = gateway();
    let (_, body) = call(&gw.router, get("/admin/setup/status")).await;
    assert_eq!(body["setup_complete"], false);

    let (status, body) = call(
        &gw.router,
        post_json("/admin/setup", json!({"password": "bootstrap-pw"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["access_token"].is_string());

    let (status, _) = call(
        &gw.router,
        post_json("/admin/setup", json!({"password": "second-try"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bootstrap_secret_mints_admin_token() {
    let gw = gateway_with(|config| {
        config.bootstrap_secret = Some("one-time-secret".to_owned());
    });
    gw.state.auth.create_user("admin", "pw-long-enough", &["admin".to_owned()]);

    let (status, _) = call(
        &gw.router,
        post_json("/admin/bootstrap-token", json!({"secret": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = call(
        &gw.router,
        post_json("/admin/bootstrap-token", json!({"secret": "one-time-secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = body["access_token"].as_str().unwrap();
    let (status, _) = call(&gw.router, with_bearer(get("/admin/status"), token)).await;
    assert_eq!(status, StatusCode::OK);
}

// ─── Provider admin ──────────────────────────────────────────────────────────

#[tokio::test]
async fn provider_key_lifecycle_hides_key_material() {
    let gw = gateway();
    let token = admin_token(&gw).await;

    let put = Request::builder()
        .method("PUT")
        .uri("/admin/providers/openai/key")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({"key": "sk-secret", "ttl_days": 30}).to_string()))
        .unwrap();
    let (status, body) = call(&gw.router, with_bearer(put, &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.to_string().contains("expires_at"));
    assert!(!body.to_string().contains("sk-secret"));

    let (status, body) = call(
        &gw.router,
        with_bearer(
            post_json("/admin/providers/openai/key/rotate", json!({"key": "sk-next"})),
            &token,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["key"]["last_rotated"].is_number());

    let (status, body) = call(
        &gw.router,
        with_bearer(get("/admin/failover/chain"), &token),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["chain"].as_array().unwrap().len() >= 2);
}
