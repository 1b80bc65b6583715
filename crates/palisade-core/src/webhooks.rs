//! Webhook registry and async dispatcher.
//!
//! Operators register HTTP callbacks for gateway events.  Delivery is
//! fire-and-forget from a bounded worker pool: a flaky receiver can never
//! block or slow the gateway.  Each delivery POST carries the event name
//! and hook id in headers and, when the hook has a secret, an
//! `X-Intelli-Signature-256: sha256=<hmac-sha256(secret, body)>` header so
//! receivers can verify payload authenticity.
//!
//! Secrets never leave the registry: list/get return a public view with a
//! boolean `signed` flag in place of the secret.

use std::{
    collections::{HashMap, VecDeque},
    fs,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::Sha256;
use tokio::sync::Semaphore;

use crate::config::WebhookSettings;

/// Closed set of event names a hook may subscribe to.
pub const VALID_EVENTS: &[&str] = &[
    "approval.created",
    "approval.approved",
    "approval.rejected",
    "gateway.alert",
];

/// Delivery worker pool size.
const MAX_WORKERS: usize = 4;

/// Delivery records kept per hook, newest first.
const DELIVERY_LOG_MAX: usize = 100;

// ─── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Webhook {
    id: String,
    url: String,
    events: Vec<String>,
    #[serde(default)]
    secret: String,
    created_at: String,
}

/// Safe public view: the raw secret is replaced by `signed`.
#[derive(Debug, Clone, Serialize)]
pub struct PublicWebhook {
    pub id: String,
    pub url: String,
    pub events: Vec<String>,
    pub signed: bool,
    pub created_at: String,
}

impl From<&Webhook> for PublicWebhook {
    fn from(hook: &Webhook) -> Self {
        Self {
            id: hook.id.clone(),
            url: hook.url.clone(),
            events: hook.events.clone(),
            signed: !hook.secret.is_empty(),
            created_at: hook.created_at.clone(),
        }
    }
}

/// Outcome of one delivery job (all attempts included).
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub timestamp: String,
    pub event: String,
    pub status: &'static str,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("url must start with http:// or https://")]
    BadUrl,
    #[error("unknown events: {0:?}")]
    UnknownEvents(Vec<String>),
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

pub struct WebhookDispatcher {
    path: PathBuf,
    hooks: Mutex<HashMap<String, Webhook>>,
    deliveries: Mutex<HashMap<String, VecDeque<DeliveryRecord>>>,
    client: reqwest::Client,
    settings: WebhookSettings,
    workers: Arc<Semaphore>,
}

impl WebhookDispatcher {
    /// Load the persisted registry (corrupted files start fresh).
    pub fn new(path: PathBuf, settings: WebhookSettings) -> Self {
        let hooks = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            hooks: Mutex::new(hooks),
            deliveries: Mutex::new(HashMap::new()),
            client: reqwest::Client::new(),
            settings,
            workers: Arc::new(Semaphore::new(MAX_WORKERS)),
        }
    }

    /// Register a hook.  `events: None` subscribes to every valid event.
    pub fn register(
        &self,
        url: &str,
        events: Option<Vec<String>>,
        secret: &str,
    ) -> Result<PublicWebhook, WebhookError> {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(WebhookError::BadUrl);
        }
        let events = match events {
            None => VALID_EVENTS.iter().map(|e| (*e).to_owned()).collect(),
            Some(list) => {
                let unknown: Vec<String> = list
                    .iter()
                    .filter(|e| !VALID_EVENTS.contains(&e.as_str()))
                    .cloned()
                    .collect();
                if !unknown.is_empty() {
                    return Err(WebhookError::UnknownEvents(unknown));
                }
                let mut sorted = list;
                sorted.sort();
                sorted.dedup();
                sorted
            }
        };
        let hook = Webhook {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.to_owned(),
            events,
            secret: secret.to_owned(),
            created_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        };
        let public = PublicWebhook::from(&hook);
        {
            let mut hooks = self.hooks.lock();
            hooks.insert(hook.id.clone(), hook);
            self.persist(&hooks);
        }
        Ok(public)
    }

    pub fn list(&self) -> Vec<PublicWebhook> {
        let mut out: Vec<PublicWebhook> =
            self.hooks.lock().values().map(PublicWebhook::from).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    pub fn get(&self, id: &str) -> Option<PublicWebhook> {
        self.hooks.lock().get(id).map(PublicWebhook::from)
    }

    pub fn delete(&self, id: &str) -> bool {
        let mut hooks = self.hooks.lock();
        if hooks.remove(id).is_none() {
            return false;
        }
        self.persist(&hooks);
        true
    }

    /// Recent deliveries for a hook, newest first.
    pub fn deliveries(&self, id: &str, limit: usize) -> Vec<DeliveryRecord> {
        let limit = limit.clamp(1, DELIVERY_LOG_MAX);
        self.deliveries
            .lock()
            .get(id)
            .map(|log| log.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Dispatch `event` to every subscriber asynchronously.
    ///
    /// The payload is encoded once; one delivery job is submitted per hook.
    pub fn fire(self: &Arc<Self>, event: &str, payload: Value) {
        let targets: Vec<Webhook> = {
            let hooks = self.hooks.lock();
            hooks
                .values()
                .filter(|h| h.events.iter().any(|e| e == event))
                .cloned()
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let mut body_map = Map::new();
        body_map.insert("event".to_owned(), json!(event));
        body_map.insert(
            "timestamp".to_owned(),
            json!(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        );
        if let Value::Object(extra) = payload {
            body_map.extend(extra);
        }
        let body = Arc::new(
            serde_json::to_vec(&Value::Object(body_map)).unwrap_or_default(),
        );

        for hook in targets {
            let dispatcher = Arc::clone(self);
            let body = Arc::clone(&body);
            let event = event.to_owned();
            tokio::spawn(async move {
                let Ok(_permit) = dispatcher.workers.acquire().await else {
                    return;
                };
                let record = dispatcher.deliver(&hook, &event, &body).await;
                dispatcher.record_delivery(&hook.id, record);
            });
        }
    }

    /// One delivery job: POST with bounded retries and exponential sleep.
    async fn deliver(&self, hook: &Webhook, event: &str, body: &[u8]) -> DeliveryRecord {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let max_attempts = self.settings.max_retries.max(1);
        let timeout = Duration::from_secs_f64(self.settings.timeout_seconds);

        let mut status_code = None;
        let mut error: Option<String> = None;
        let mut attempts = 0;
        let mut ok = false;

        for attempt in 0..max_attempts {
            attempts += 1;
            let mut req = self
                .client
                .post(&hook.url)
                .timeout(timeout)
                .header("Content-Type", "application/json")
                .header("X-Gateway-Event", event)
                .header("X-Gateway-Hook-ID", &hook.id)
                .body(body.to_vec());
            if !hook.secret.is_empty() {
                req = req.header(
                    "X-Intelli-Signature-256",
                    format!("sha256={}", sign(&hook.secret, body)),
                );
            }
            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    status_code = Some(status.as_u16());
                    if status.is_success() {
                        ok = true;
                        error = None;
                        break;
                    }
                    error = Some(format!("HTTP {}", status.as_u16()));
                    if status.as_u16() < 500 {
                        // Client error; the receiver will never accept this.
                        break;
                    }
                }
                Err(err) => {
                    error = Some(err.to_string());
                }
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
            }
        }

        DeliveryRecord {
            timestamp,
            event: event.to_owned(),
            status: if ok { "ok" } else { "error" },
            status_code,
            error,
            attempts,
        }
    }

    fn record_delivery(&self, hook_id: &str, record: DeliveryRecord) {
        let mut deliveries = self.deliveries.lock();
        let log = deliveries.entry(hook_id.to_owned()).or_default();
        log.push_front(record);
        log.truncate(DELIVERY_LOG_MAX);
    }

    fn persist(&self, hooks: &HashMap<String, Webhook>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(hooks) {
            if let Err(err) = fs::write(&self.path, json) {
                tracing::warn!(%err, "failed to persist webhook registry");
            }
        }
    }
}

/// `hex(hmac-sha256(secret, body))`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dispatcher(dir: &TempDir) -> WebhookDispatcher {
        WebhookDispatcher::new(dir.path().join("webhooks.json"), WebhookSettings::default())
    }

    #[test]
    fn register_defaults_to_all_events() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let hook = d.register("https://example.com/hook", None, "").unwrap();
        assert_eq!(hook.events.len(), VALID_EVENTS.len());
        assert!(!hook.signed);
    }

    #[test]
    fn unknown_events_are_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let err = d
            .register("https://example.com", Some(vec!["nope.event".to_owned()]), "")
            .unwrap_err();
        assert!(matches!(err, WebhookError::UnknownEvents(ref e) if e == &["nope.event"]));
    }

    #[test]
    fn bad_url_scheme_is_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        assert!(matches!(
            d.register("ftp://example.com", None, ""),
            Err(WebhookError::BadUrl)
        ));
    }

    #[test]
    fn secret_never_leaks_through_public_views() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let hook = d
            .register("https://example.com", Some(vec!["gateway.alert".to_owned()]), "s3cr3t")
            .unwrap();
        assert!(hook.signed);
        let listed = d.list();
        assert_eq!(listed.len(), 1);
        let as_json = serde_json::to_string(&d.get(&hook.id).unwrap()).unwrap();
        assert!(!as_json.contains("s3cr3t"));
        assert!(as_json.contains("\"signed\":true"));
    }

    #[test]
    fn register_list_get_delete_roundtrip() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        let hook = d.register("https://example.com", None, "").unwrap();
        assert!(d.get(&hook.id).is_some());
        assert!(d.delete(&hook.id));
        assert!(d.get(&hook.id).is_none());
        assert!(!d.delete(&hook.id));
    }

    #[test]
    fn registry_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let id = {
            let d = dispatcher(&dir);
            d.register("https://example.com", None, "k").unwrap().id
        };
        let d = dispatcher(&dir);
        let hook = d.get(&id).expect("persisted hook reloads");
        assert!(hook.signed);
    }

    #[test]
    fn signature_is_stable_hmac_sha256() {
        // Known-answer check so receiver implementations can verify against us.
        let sig = sign("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn delivery_ring_is_bounded_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(&dir);
        for i in 0..150u32 {
            d.record_delivery("hook-1", DeliveryRecord {
                timestamp: format!("t{i}"),
                event: "gateway.alert".to_owned(),
                status: "ok",
                status_code: Some(200),
                error: None,
                attempts: 1,
            });
        }
        let log = d.deliveries("hook-1", 500);
        assert_eq!(log.len(), DELIVERY_LOG_MAX);
        assert_eq!(log[0].timestamp, "t149");
        assert_eq!(d.deliveries("hook-1", 5).len(), 5);
        assert!(d.deliveries("unknown", 10).is_empty());
    }
}
