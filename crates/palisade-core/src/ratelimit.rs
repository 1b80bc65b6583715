//! Dual sliding-window rate limiter.
//!
//! Two independent policies: per-client (IP, trusting the left-most
//! `x-forwarded-for` entry when present; the extraction lives in the
//! gateway layer) and per-user (username, applied after authentication).
//! Each policy keeps a deque of monotonic timestamps per key; entries older
//! than the window are popped before the new request is counted.
//!
//! The limiter is in-process and intentionally so: the gateway is a
//! single-node deployment.  Settings are runtime-reconfigurable through
//! the admin API without restarting.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::RateLimitSettings;

/// Which policy rejected the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    Client,
    User,
}

/// Raised on breach; the gateway maps this to HTTP 429 with a
/// `Retry-After` header.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitExceeded {
    pub scope: LimitScope,
    pub limit: usize,
    pub window_seconds: u64,
    pub retry_after_seconds: u64,
    /// Set for user-scope breaches.
    pub user: Option<String>,
}

/// Partial settings update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitUpdate {
    pub max_requests: Option<usize>,
    pub window_seconds: Option<f64>,
    pub burst: Option<usize>,
    pub enabled: Option<bool>,
    pub user_max_requests: Option<usize>,
    pub user_window_seconds: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitConfigError {
    #[error("max_requests must be >= 1")]
    MaxRequests,
    #[error("window_seconds must be > 0")]
    Window,
    #[error("user_max_requests must be >= 1")]
    UserMaxRequests,
    #[error("user_window_seconds must be > 0")]
    UserWindow,
}

/// Snapshot row for the admin usage endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ClientUsage {
    pub client: String,
    pub requests_in_window: usize,
    pub remaining: usize,
}

// ─── RateLimiter ─────────────────────────────────────────────────────────────

pub struct RateLimiter {
    settings: Mutex<RateLimitSettings>,
    client_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    user_windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            client_windows: Mutex::new(HashMap::new()),
            user_windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count a request for `client_key` (IP or forwarded IP).
    ///
    /// Breach happens at exactly `max + burst` requests already in the
    /// window; `max + burst - 1` passes.
    pub fn check_client(&self, client_key: &str) -> Result<(), RateLimitExceeded> {
        let cfg = self.settings.lock().clone();
        if !cfg.enabled {
            return Ok(());
        }
        let window = Duration::from_secs_f64(cfg.window_seconds);
        let effective = cfg.max_requests + cfg.burst;
        let mut windows = self.client_windows.lock();
        let dq = windows.entry(client_key.to_owned()).or_default();
        Self::admit(dq, window, effective).map_err(|retry_after| RateLimitExceeded {
            scope: LimitScope::Client,
            limit: cfg.max_requests,
            window_seconds: cfg.window_seconds as u64,
            retry_after_seconds: retry_after,
            user: None,
        })
    }

    /// Count a request for an authenticated username.  No burst allowance.
    pub fn check_user(&self, username: &str) -> Result<(), RateLimitExceeded> {
        let cfg = self.settings.lock().clone();
        if !cfg.enabled {
            return Ok(());
        }
        let window = Duration::from_secs_f64(cfg.user_window_seconds);
        let mut windows = self.user_windows.lock();
        let dq = windows.entry(username.to_owned()).or_default();
        Self::admit(dq, window, cfg.user_max_requests).map_err(|retry_after| {
            RateLimitExceeded {
                scope: LimitScope::User,
                limit: cfg.user_max_requests,
                window_seconds: cfg.user_window_seconds as u64,
                retry_after_seconds: retry_after,
                user: Some(username.to_owned()),
            }
        })
    }

    /// Prune expired stamps, then either record the request or return the
    /// computed retry-after in seconds.
    fn admit(
        dq: &mut VecDeque<Instant>,
        window: Duration,
        limit: usize,
    ) -> Result<(), u64> {
        let now = Instant::now();
        while dq.front().is_some_and(|t| now.duration_since(*t) >= window) {
            dq.pop_front();
        }
        if dq.len() >= limit {
            let oldest_age = dq
                .front()
                .map(|t| now.duration_since(*t))
                .unwrap_or_default();
            let retry = window.saturating_sub(oldest_age).as_secs() + 1;
            return Err(retry.max(1));
        }
        dq.push_back(now);
        Ok(())
    }

    // ── Admin operations ─────────────────────────────────────────────────

    pub fn config(&self) -> RateLimitSettings {
        self.settings.lock().clone()
    }

    pub fn update_config(
        &self,
        update: RateLimitUpdate,
    ) -> Result<RateLimitSettings, RateLimitConfigError> {
        let mut cfg = self.settings.lock();
        if let Some(v) = update.max_requests {
            if v < 1 {
                return Err(RateLimitConfigError::MaxRequests);
            }
            cfg.max_requests = v;
        }
        if let Some(v) = update.window_seconds {
            if v <= 0.0 {
                return Err(RateLimitConfigError::Window);
            }
            cfg.window_seconds = v;
        }
        if let Some(v) = update.burst {
            cfg.burst = v;
        }
        if let Some(v) = update.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = update.user_max_requests {
            if v < 1 {
                return Err(RateLimitConfigError::UserMaxRequests);
            }
            cfg.user_max_requests = v;
        }
        if let Some(v) = update.user_window_seconds {
            if v <= 0.0 {
                return Err(RateLimitConfigError::UserWindow);
            }
            cfg.user_window_seconds = v;
        }
        Ok(cfg.clone())
    }

    pub fn reset_client(&self, key: &str) {
        self.client_windows.lock().remove(key);
    }

    pub fn reset_user(&self, username: &str) {
        self.user_windows.lock().remove(username);
    }

    pub fn reset_all(&self) {
        self.client_windows.lock().clear();
        self.user_windows.lock().clear();
    }

    /// Current usage for a single client key.
    pub fn current_usage(&self, client_key: &str) -> Value {
        let cfg = self.settings.lock().clone();
        let window = Duration::from_secs_f64(cfg.window_seconds);
        let now = Instant::now();
        let count = self
            .client_windows
            .lock()
            .get(client_key)
            .map(|dq| dq.iter().filter(|t| now.duration_since(**t) < window).count())
            .unwrap_or(0);
        json!({
            "client": client_key,
            "requests_in_window": count,
            "limit": cfg.max_requests,
            "burst": cfg.burst,
            "window_seconds": cfg.window_seconds as u64,
            "remaining": cfg.max_requests.saturating_sub(count),
        })
    }

    /// All client keys with non-empty windows.
    pub fn usage_snapshot(&self) -> Vec<ClientUsage> {
        let cfg = self.settings.lock().clone();
        let window = Duration::from_secs_f64(cfg.window_seconds);
        let now = Instant::now();
        self.client_windows
            .lock()
            .iter()
            .filter_map(|(key, dq)| {
                let count = dq.iter().filter(|t| now.duration_since(**t) < window).count();
                (count > 0).then(|| ClientUsage {
                    client: key.clone(),
                    requests_in_window: count,
                    remaining: cfg.max_requests.saturating_sub(count),
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
