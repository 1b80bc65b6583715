//! Provider failover with per-provider exponential cooldown.
//!
//! When the primary provider fails with a retriable error (rate limit,
//! 5xx, connectivity) the router tries the next entry in the configured
//! chain.  Failing providers go on cooldown for an exponentially growing
//! window (30 s doubling to a 10 min ceiling); expiry is checked lazily on
//! each request, so no background task is needed, and any success clears
//! the provider's cooldown.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{AdapterRegistry, ChatMessage, ChatOptions, ChatOutcome, Result};

const COOLDOWN_BASE: f64 = 30.0;
const COOLDOWN_FACTOR: f64 = 2.0;
const COOLDOWN_MAX: f64 = 600.0;

const RATE_LIMIT_MARKERS: &[&str] =
    &["429", "rate limit", "rate_limit", "too many requests", "quota"];
const SERVER_ERR_MARKERS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "connection error",
    "timeout",
    "connecterror",
    "connectionerror",
    "read timeout",
    "service unavailable",
    "internal server error",
];

fn is_retriable(err: &str) -> bool {
    let msg = err.to_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .chain(SERVER_ERR_MARKERS)
        .any(|m| msg.contains(m))
}

// ─── Chain ───────────────────────────────────────────────────────────────────

/// One failover chain entry.  `model: None` uses the provider's default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
}

/// Result of a routed call: the adapter outcome plus failover metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverOutcome {
    #[serde(flatten)]
    pub outcome: ChatOutcome,
    pub failover_used: bool,
    pub actual_provider: String,
    pub actual_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover_reason: Option<String>,
}

impl FailoverOutcome {
    /// Metadata-only view for merging into response envelopes.
    pub fn meta(&self) -> Value {
        let mut meta = json!({
            "failover_used": self.failover_used,
            "actual_provider": self.actual_provider,
            "actual_model": self.actual_model,
        });
        if let Some(reason) = &self.failover_reason {
            meta["failover_reason"] = json!(reason);
        }
        meta
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub struct FailoverRouter {
    registry: Arc<AdapterRegistry>,
    chain: Mutex<Vec<ChainEntry>>,
    /// provider → (cooldown expiry, current backoff seconds).
    cooldowns: Mutex<HashMap<String, (Instant, f64)>>,
}

impl FailoverRouter {
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        let chain = ["openai", "anthropic", "ollama"]
            .into_iter()
            .map(|p| ChainEntry { provider: p.to_owned(), model: None })
            .collect();
        Self {
            registry,
            chain: Mutex::new(chain),
            cooldowns: Mutex::new(HashMap::new()),
        }
    }

    pub fn chain(&self) -> Vec<ChainEntry> {
        self.chain.lock().clone()
    }

    pub fn set_chain(&self, entries: Vec<ChainEntry>) {
        *self.chain.lock() = entries;
    }

    /// Cooldown state for the admin/health endpoints.
    pub fn cooldown_status(&self) -> Vec<Value> {
        let now = Instant::now();
        self.cooldowns
            .lock()
            .iter()
            .map(|(provider, (expires, backoff))| {
                json!({
                    "provider": provider,
                    "expires_in": expires.saturating_duration_since(now).as_secs_f64(),
                    "backoff": backoff,
                })
            })
            .collect()
    }

    /// True when the primary or any chain member could take a call now.
    pub fn is_available(&self, primary: &str) -> bool {
        let mut candidates = vec![primary.to_owned()];
        candidates.extend(self.chain.lock().iter().map(|e| e.provider.clone()));
        candidates.into_iter().any(|p| {
            !self.on_cooldown(&p)
                && self.registry.get(&p).is_some_and(|a| a.is_available())
        })
    }

    /// Route a chat call: primary first, then chain entries that are not
    /// the primary, skipping providers on cooldown.
    pub async fn chat_with_failover(
        &self,
        primary: &str,
        primary_model: Option<&str>,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<FailoverOutcome> {
        let mut attempts: Vec<(String, Option<String>)> =
            vec![(primary.to_owned(), primary_model.map(str::to_owned))];
        for entry in self.chain.lock().iter() {
            if entry.provider != primary {
                attempts.push((entry.provider.clone(), entry.model.clone()));
            }
        }

        let mut last_err: Option<String> = None;
        let mut failover_used = false;
        let mut failover_reason = String::new();

        for (idx, (provider, model)) in attempts.iter().enumerate() {
            if self.on_cooldown(provider) {
                tracing::debug!(%provider, "failover: skipping provider on cooldown");
                continue;
            }
            let Some(adapter) = self.registry.get(provider) else {
                continue;
            };
            if !adapter.is_available() {
                continue;
            }

            let mut call_opts = opts.clone();
            call_opts.model = model.clone().or_else(|| call_opts.model.clone());

            match adapter.chat_complete(messages, &call_opts).await {
                Ok(outcome) => {
                    self.clear_cooldown(provider);
                    let actual_model = outcome.model.clone();
                    if failover_used {
                        tracing::info!(%provider, %actual_model, "failover: recovered");
                    }
                    return Ok(FailoverOutcome {
                        outcome,
                        failover_used,
                        actual_provider: provider.clone(),
                        actual_model,
                        failover_reason: failover_used.then(|| failover_reason.clone()),
                    });
                }
                Err(err) => {
                    if is_retriable(&err) {
                        self.record_failure(provider);
                        if idx == 0 {
                            failover_used = true;
                            failover_reason = err.chars().take(200).collect();
                            tracing::warn!(
                                %provider,
                                error = %err,
                                "failover: primary errored, trying next in chain"
                            );
                        }
                        last_err = Some(err);
                    } else if idx == 0 {
                        // Non-retriable primary error: surface it as-is.
                        return Err(err);
                    } else {
                        tracing::debug!(%provider, error = %err, "failover: non-retriable");
                        last_err = Some(err);
                    }
                }
            }
        }

        Err(format!(
            "All providers in failover chain exhausted. Last error: {}",
            last_err.unwrap_or_else(|| "no provider attempted".to_owned())
        ))
    }

    // ── Cooldown bookkeeping ─────────────────────────────────────────────

    fn on_cooldown(&self, provider: &str) -> bool {
        self.cooldowns
            .lock()
            .get(provider)
            .is_some_and(|(expires, _)| Instant::now() < *expires)
    }

    fn record_failure(&self, provider: &str) {
        let mut cooldowns = self.cooldowns.lock();
        let prev_backoff = cooldowns
            .get(provider)
            .map(|(_, b)| *b)
            .unwrap_or(COOLDOWN_BASE / COOLDOWN_FACTOR);
        let backoff = (prev_backoff * COOLDOWN_FACTOR).min(COOLDOWN_MAX);
        cooldowns.insert(
            provider.to_owned(),
            (Instant::now() + Duration::from_secs_f64(backoff), backoff),
        );
        tracing::warn!(%provider, backoff_seconds = backoff, "failover: provider on cooldown");
    }

    fn clear_cooldown(&self, provider: &str) {
        self.cooldowns.lock().remove(provider);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
