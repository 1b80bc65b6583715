//! Request authentication helpers.
//!
//! `Authorization: Bearer <opaque-token>` everywhere; admin endpoints
//! additionally require the `admin` role.  The client key for rate
//! limiting trusts the left-most `x-forwarded-for` entry when present and
//! falls back to the socket peer address.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, request::Parts},
};
use serde_json::json;

use super::{error::ApiError, state::AppState};
use crate::auth::AuthUser;

/// Extract the raw bearer token, or the matching 401.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, ApiError> {
    let raw = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing authorization"))?;
    let mut parts = raw.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => {
            Ok(token.to_owned())
        }
        _ => Err(ApiError::unauthorized("invalid authorization")),
    }
}

/// Any authenticated user (expired/revoked tokens are 401).
pub fn require_user(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let token = bearer_token(headers)?;
    state
        .auth
        .user_for_token(&token)
        .ok_or_else(|| ApiError::unauthorized("invalid or expired token"))
}

/// Authenticated user with the `admin` role (403 otherwise).
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, ApiError> {
    let user = require_user(state, headers)?;
    if user.is_admin() {
        Ok(user)
    } else {
        Err(ApiError::forbidden(json!("forbidden")))
    }
}

/// The authenticated user when a valid token is supplied, `None` for
/// anonymous or malformed credentials (endpoints that allow both).
pub fn optional_user(state: &AppState, headers: &HeaderMap) -> Option<AuthUser> {
    let token = bearer_token(headers).ok()?;
    state.auth.user_for_token(&token)
}

/// Short token prefix used as the consent-timeline actor label.
pub fn actor_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}…")
}

// ─── Client address extractor ────────────────────────────────────────────────

/// Stable key for the requesting client: left-most `x-forwarded-for`
/// entry, else the socket peer IP, else `"unknown"` (in-process tests).
#[derive(Debug, Clone)]
pub struct ClientKey(pub String);

impl<S> FromRequestParts<S> for ClientKey
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(forwarded) = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return Ok(Self(first.to_owned()));
                }
            }
        }
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        Ok(Self(peer))
    }
}
