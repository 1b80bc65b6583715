//! Login, token refresh/revocation, first-run setup, and the
//! bootstrap-secret path used by an embedding shell.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::gateway::{
    authn::{ClientKey, require_admin},
    error::ApiError,
    state::AppState,
};

/// Lifetime of the admin token minted through the bootstrap secret.
const BOOTSTRAP_TOKEN_TTL: u64 = 30 * 24 * 3600;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/login", post(login))
        .route("/admin/refresh", post(refresh))
        .route("/admin/revoke", post(revoke))
        .route("/admin/setup/status", get(setup_status))
        .route("/admin/setup", post(setup))
        .route("/admin/bootstrap-token", post(bootstrap_token))
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    username: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.rate_limiter.check_client(&client.0)?;
    match state.auth.authenticate(&body.username, &body.password) {
        Some(pair) => {
            state
                .audit
                .record("login", Some(&body.username), json!({ "ok": true }));
            Ok(Json(pair))
        }
        None => {
            state
                .audit
                .record("login", Some(&body.username), json!({ "ok": false }));
            Err(ApiError::unauthorized("invalid credentials"))
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshBody>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .auth
        .tokens
        .refresh_access(&body.refresh_token)
        .map(|access_token| Json(json!({ "access_token": access_token })))
        .ok_or_else(|| ApiError::unauthorized("invalid or expired refresh token"))
}

#[derive(Debug, Deserialize)]
struct RevokeBody {
    token: String,
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RevokeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let admin = require_admin(&state, &headers)?;
    let removed = state.auth.tokens.revoke(&body.token);
    state
        .audit
        .record("token_revoke", Some(&admin.username), json!({ "removed": removed }));
    Ok(Json(json!({ "revoked": true, "was_live": removed })))
}

// ─── First-run setup ─────────────────────────────────────────────────────────

async fn setup_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "setup_complete": state.auth.has_users() }))
}

#[derive(Debug, Deserialize)]
struct SetupBody {
    password: String,
}

/// Create the initial admin.  Only available while no user exists.
async fn setup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SetupBody>,
) -> Result<impl IntoResponse, ApiError> {
    if state.auth.has_users() {
        return Err(ApiError::forbidden(json!("setup already completed")));
    }
    if body.password.len() < 8 {
        return Err(ApiError::bad_request(json!("password must be at least 8 characters")));
    }
    state.auth.create_user("admin", &body.password, &["admin".to_owned()]);
    state.audit.record("admin_setup", Some("admin"), json!({}));
    let pair = state
        .auth
        .authenticate("admin", &body.password)
        .ok_or_else(|| ApiError::bad_gateway("setup succeeded but login failed".to_owned()))?;
    Ok(Json(pair))
}

// ─── Bootstrap secret ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct BootstrapBody {
    secret: String,
}

/// Mint a long-lived admin token for a caller that proves possession of
/// the one-time boot secret.  Compared in constant time.
async fn bootstrap_token(
    State(state): State<Arc<AppState>>,
    client: ClientKey,
    Json(body): Json<BootstrapBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.rate_limiter.check_client(&client.0)?;
    let Some(expected) = &state.config.bootstrap_secret else {
        return Err(ApiError::not_found("bootstrap disabled"));
    };
    let matches: bool = expected.as_bytes().ct_eq(body.secret.as_bytes()).into();
    if !matches {
        state.audit.record("bootstrap_token", None, json!({ "ok": false }));
        return Err(ApiError::forbidden(json!("invalid bootstrap secret")));
    }
    if !state.auth.user_exists("admin") {
        return Err(ApiError::forbidden(json!("no admin user exists yet")));
    }
    let token = state
        .auth
        .tokens
        .issue_access_with_ttl("admin", BOOTSTRAP_TOKEN_TTL);
    state.audit.record("bootstrap_token", Some("admin"), json!({ "ok": true }));
    Ok(Json(json!({ "access_token": token, "expires_in": BOOTSTRAP_TOKEN_TTL })))
}
