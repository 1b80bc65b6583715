//! Provider API key store with TTL rotation metadata.
//!
//! Keys live in a single JSON map keyed by provider name.  Each record
//! carries set-at / expires-at / last-rotated stamps so operators can see
//! which keys are due for rotation without ever reading the key itself;
//! status endpoints only expose the metadata.

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    key: String,
    set_at: f64,
    expires_at: Option<f64>,
    last_rotated: Option<f64>,
}

/// Public view of a key record: metadata only, never the key.
#[derive(Debug, Clone, Serialize)]
pub struct KeyMetadata {
    pub provider: String,
    pub set_at: f64,
    pub expires_at: Option<f64>,
    pub last_rotated: Option<f64>,
    pub expired: bool,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct ProviderKeyStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, KeyRecord>>,
}

impl ProviderKeyStore {
    pub fn new(path: PathBuf) -> Self {
        let records = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self { path, records: Mutex::new(records) }
    }

    /// Store a key; `ttl_days: None` never expires.
    pub fn set_key(&self, provider: &str, key: &str, ttl_days: Option<f64>) {
        let now = now_epoch();
        let mut records = self.records.lock();
        let last_rotated = records.get(provider).and_then(|r| r.last_rotated);
        records.insert(provider.to_owned(), KeyRecord {
            key: key.to_owned(),
            set_at: now,
            expires_at: ttl_days.map(|d| now + d * SECONDS_PER_DAY),
            last_rotated,
        });
        self.persist(&records);
    }

    /// Replace the key, stamp `last_rotated`, and restart the TTL clock
    /// with the same duration the old key had.
    pub fn rotate_key(&self, provider: &str, new_key: &str) -> bool {
        let now = now_epoch();
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(provider) else {
            return false;
        };
        let ttl = record.expires_at.map(|exp| exp - record.set_at);
        record.key = new_key.to_owned();
        record.set_at = now;
        record.expires_at = ttl.map(|t| now + t);
        record.last_rotated = Some(now);
        self.persist(&records);
        true
    }

    /// The live key, or `None` when unset or past its expiry.
    pub fn get_key(&self, provider: &str) -> Option<String> {
        let records = self.records.lock();
        let record = records.get(provider)?;
        if record.expires_at.is_some_and(|exp| exp <= now_epoch()) {
            return None;
        }
        Some(record.key.clone())
    }

    pub fn delete_key(&self, provider: &str) -> bool {
        let mut records = self.records.lock();
        let removed = records.remove(provider).is_some();
        if removed {
            self.persist(&records);
        }
        removed
    }

    pub fn metadata(&self, provider: &str) -> Option<KeyMetadata> {
        let records = self.records.lock();
        records.get(provider).map(|r| to_metadata(provider, r))
    }

    /// Keys that expire within `within_days` (already-expired included).
    pub fn list_expiring(&self, within_days: f64) -> Vec<KeyMetadata> {
        let cutoff = now_epoch() + within_days * SECONDS_PER_DAY;
        let records = self.records.lock();
        records
            .iter()
            .filter(|(_, r)| r.expires_at.is_some_and(|exp| exp <= cutoff))
            .map(|(p, r)| to_metadata(p, r))
            .collect()
    }

    pub fn providers_with_keys(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    fn persist(&self, records: &BTreeMap<String, KeyRecord>) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(records) {
            if let Err(err) = fs::write(&self.path, json) {
                tracing::warn!(%err, "failed to persist provider keys");
            }
        }
    }
}

fn to_metadata(provider: &str, record: &KeyRecord) -> KeyMetadata {
    KeyMetadata {
        provider: provider.to_owned(),
        set_at: record.set_at,
        expires_at: record.expires_at,
        last_rotated: record.last_rotated,
        expired: record.expires_at.is_some_and(|exp| exp <= now_epoch()),
    }
}
