//! Per-agent persistent key-value memory.
//!
//! Each agent owns one JSON file under the memory directory.  Agent ids are
//! restricted to `[A-Za-z0-9_-]{1,128}` and the resolved path is verified
//! to stay inside the memory dir, so an id can never reach another file.
//!
//! Values may carry a TTL via the wrap shape `{__v: value, __exp: epoch}`;
//! expired entries read as absent and are lazily pruned on the next read.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};

const WRAP_KEY: &str = "__v";
const EXP_KEY: &str = "__exp";

static SAFE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static id pattern compiles"));

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("agent_id must match [A-Za-z0-9_-]{{1,128}}, got {0:?}")]
    InvalidAgentId(String),
    #[error("agent_id {0:?} escapes the memory directory")]
    PathEscape(String),
    #[error("memory I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Value plus expiry metadata, for the key-inspection endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryMeta {
    pub value: Value,
    pub expires_at: Option<f64>,
}

/// Counts returned by [`AgentMemoryStore::import_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub imported_agents: usize,
    pub imported_keys: usize,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn is_wrapped(raw: &Value) -> bool {
    raw.as_object().is_some_and(|o| o.contains_key(WRAP_KEY))
}

fn unwrap_value(raw: &Value) -> (Value, Option<f64>) {
    if is_wrapped(raw) {
        let obj = raw.as_object().expect("checked above");
        (
            obj.get(WRAP_KEY).cloned().unwrap_or(Value::Null),
            obj.get(EXP_KEY).and_then(Value::as_f64),
        )
    } else {
        (raw.clone(), None)
    }
}

fn wrap_value(value: Value, ttl_seconds: Option<f64>) -> Value {
    match ttl_seconds {
        None => value,
        Some(ttl) => {
            let mut wrapped = Map::new();
            wrapped.insert(WRAP_KEY.to_owned(), value);
            wrapped.insert(EXP_KEY.to_owned(), json!(now_epoch() + ttl));
            Value::Object(wrapped)
        }
    }
}

// ─── AgentMemoryStore ────────────────────────────────────────────────────────

pub struct AgentMemoryStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl AgentMemoryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, lock: Mutex::new(()) }
    }

    // ── Key operations ───────────────────────────────────────────────────

    /// Read one key; expired entries are treated as absent and pruned.
    pub fn get(&self, agent_id: &str, key: &str) -> Result<Option<Value>, MemoryError> {
        let _guard = self.lock.lock();
        let (live, raw_live, raw_all) = self.load_split(agent_id)?;
        if raw_live.len() < raw_all.len() {
            self.save(agent_id, &raw_live)?;
        }
        Ok(live.get(key).cloned())
    }

    /// Upsert a key, optionally with a TTL in seconds.
    pub fn set(
        &self,
        agent_id: &str,
        key: &str,
        value: Value,
        ttl_seconds: Option<f64>,
    ) -> Result<(), MemoryError> {
        let _guard = self.lock.lock();
        let mut raw = self.load_raw(agent_id)?;
        raw.insert(key.to_owned(), wrap_value(value, ttl_seconds));
        self.save(agent_id, &raw)
    }

    /// Remove a key.  `Ok(false)` when it did not exist (or had expired).
    pub fn delete(&self, agent_id: &str, key: &str) -> Result<bool, MemoryError> {
        let _guard = self.lock.lock();
        let (live, mut raw_live, _) = self.load_split(agent_id)?;
        if !live.contains_key(key) {
            return Ok(false);
        }
        raw_live.remove(key);
        self.save(agent_id, &raw_live)?;
        Ok(true)
    }

    /// The full live view (expired keys excluded, file pruned).
    pub fn list(&self, agent_id: &str) -> Result<BTreeMap<String, Value>, MemoryError> {
        let _guard = self.lock.lock();
        let (live, raw_live, raw_all) = self.load_split(agent_id)?;
        if raw_live.len() < raw_all.len() {
            self.save(agent_id, &raw_live)?;
        }
        Ok(live)
    }

    /// Erase all keys (expired included).  Returns the count removed.
    pub fn clear(&self, agent_id: &str) -> Result<usize, MemoryError> {
        let _guard = self.lock.lock();
        let raw = self.load_raw(agent_id)?;
        let count = raw.len();
        self.save(agent_id, &Map::new())?;
        Ok(count)
    }

    /// Remove only expired keys.  Returns the count pruned.
    pub fn prune(&self, agent_id: &str) -> Result<usize, MemoryError> {
        let _guard = self.lock.lock();
        let (_, raw_live, raw_all) = self.load_split(agent_id)?;
        let pruned = raw_all.len() - raw_live.len();
        if pruned > 0 {
            self.save(agent_id, &raw_live)?;
        }
        Ok(pruned)
    }

    /// `{value, expires_at}` for a key, or `None` when absent/expired.
    pub fn get_meta(&self, agent_id: &str, key: &str) -> Result<Option<MemoryMeta>, MemoryError> {
        let _guard = self.lock.lock();
        let (live, raw_live, _) = self.load_split(agent_id)?;
        Ok(live.get(key).map(|value| {
            let expires_at = raw_live.get(key).and_then(|raw| unwrap_value(raw).1);
            MemoryMeta { value: value.clone(), expires_at }
        }))
    }

    // ── Agent operations ─────────────────────────────────────────────────

    /// Sorted ids of all agents with a memory file.
    pub fn list_agents(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<String> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                (path.extension().is_some_and(|x| x == "json"))
                    .then(|| path.file_stem()?.to_str().map(str::to_owned))
                    .flatten()
            })
            .collect();
        out.sort();
        out
    }

    /// Snapshot of every agent's live memory.
    pub fn export_all(&self) -> Value {
        let agents = self.list_agents();
        let mut snapshot = Map::new();
        let mut key_count = 0;
        for agent_id in &agents {
            if let Ok(live) = self.list(agent_id) {
                key_count += live.len();
                snapshot.insert(agent_id.clone(), serde_json::to_value(live).unwrap_or_default());
            }
        }
        json!({
            "agents": snapshot,
            "agent_count": agents.len(),
            "key_count": key_count,
            "exported_at": Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        })
    }

    /// Restore agent memories from a backup mapping `agent_id → {key: value}`.
    ///
    /// With `merge`, imported keys overwrite but unrelated keys survive;
    /// without it each imported agent's memory is replaced wholesale.
    /// Values are stored bare (no TTL).
    pub fn import_all(
        &self,
        data: &Map<String, Value>,
        merge: bool,
    ) -> Result<ImportStats, MemoryError> {
        let mut stats = ImportStats { imported_agents: 0, imported_keys: 0 };
        for (agent_id, keys) in data {
            validate_id(agent_id)?;
            let Some(keys) = keys.as_object() else { continue };
            if keys.is_empty() {
                continue;
            }
            let _guard = self.lock.lock();
            let mut target = if merge {
                let (_, raw_live, _) = self.load_split(agent_id)?;
                raw_live
            } else {
                Map::new()
            };
            for (key, value) in keys {
                target.insert(key.clone(), value.clone());
            }
            self.save(agent_id, &target)?;
            stats.imported_agents += 1;
            stats.imported_keys += keys.len();
        }
        Ok(stats)
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn agent_path(&self, agent_id: &str) -> Result<PathBuf, MemoryError> {
        validate_id(agent_id)?;
        fs::create_dir_all(&self.dir)?;
        let base = self.dir.canonicalize()?;
        let joined = base.join(format!("{agent_id}.json"));
        if !joined.starts_with(&base) {
            return Err(MemoryError::PathEscape(agent_id.to_owned()));
        }
        Ok(joined)
    }

    fn load_raw(&self, agent_id: &str) -> Result<Map<String, Value>, MemoryError> {
        let path = self.agent_path(agent_id)?;
        Ok(read_map(&path))
    }

    /// Returns `(live_values, live_raw_entries, all_raw_entries)`.
    #[allow(clippy::type_complexity)]
    fn load_split(
        &self,
        agent_id: &str,
    ) -> Result<(BTreeMap<String, Value>, Map<String, Value>, Map<String, Value>), MemoryError>
    {
        let raw_all = self.load_raw(agent_id)?;
        let now = now_epoch();
        let mut live = BTreeMap::new();
        let mut raw_live = Map::new();
        for (k, raw_v) in &raw_all {
            let (value, exp) = unwrap_value(raw_v);
            if exp.is_some_and(|e| e <= now) {
                continue; // expired, drop silently
            }
            live.insert(k.clone(), value);
            raw_live.insert(k.clone(), raw_v.clone());
        }
        Ok((live, raw_live, raw_all))
    }

    fn save(&self, agent_id: &str, data: &Map<String, Value>) -> Result<(), MemoryError> {
        let path = self.agent_path(agent_id)?;
        let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_owned());
        fs::write(path, json)?;
        Ok(())
    }
}

fn validate_id(agent_id: &str) -> Result<(), MemoryError> {
    if SAFE_ID.is_match(agent_id) {
        Ok(())
    } else {
        Err(MemoryError::InvalidAgentId(agent_id.to_owned()))
    }
}

fn read_map(path: &Path) -> Map<String, Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
