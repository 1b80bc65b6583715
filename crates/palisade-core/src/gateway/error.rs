//! HTTP error mapping.
//!
//! Pipeline verdicts and service errors are tagged results everywhere
//! else; this is the one place that turns tags into status codes.  Every
//! error body is `{"detail": ...}` so clients have a single shape to
//! parse, matching the taxonomy in the gateway's API contract.

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::ratelimit::RateLimitExceeded;

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: Value,
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: Value) -> Self {
        Self { status, detail, retry_after: None }
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, json!(message))
    }

    pub fn forbidden(detail: Value) -> Self {
        Self::new(StatusCode::FORBIDDEN, detail)
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, json!(message))
    }

    pub fn bad_request(detail: Value) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn bad_gateway(message: String) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, json!(message))
    }

    pub fn service_unavailable(detail: Value) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }

    pub fn kill_switch(reason: &str) -> Self {
        Self::service_unavailable(json!({
            "error": "gateway kill-switch is active",
            "reason": reason,
        }))
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(err: RateLimitExceeded) -> Self {
        let detail = match &err.user {
            Some(user) => json!({
                "error": "user_rate_limit_exceeded",
                "user": user,
                "limit": err.limit,
                "window_seconds": err.window_seconds,
                "retry_after_seconds": err.retry_after_seconds,
            }),
            None => json!({
                "error": "rate_limit_exceeded",
                "limit": err.limit,
                "window_seconds": err.window_seconds,
                "retry_after_seconds": err.retry_after_seconds,
            }),
        };
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            detail,
            retry_after: Some(err.retry_after_seconds),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "detail": self.detail }));
        let mut response = (self.status, body).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
