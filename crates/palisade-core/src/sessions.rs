//! Chat session persistence.
//!
//! One JSON file per session under the sessions directory.  Persistence is
//! best-effort and happens after the response is already on the wire, so a
//! client that fetches a session immediately after receiving its
//! `session_id` may briefly race the index; the store is eventually
//! consistent by design.

use std::{fs, path::PathBuf, sync::LazyLock};

use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static SAFE_SESSION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}$").expect("static session-id pattern compiles"));

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    pub ts: String,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: String,
    pub messages: Vec<SessionMessage>,
}

/// Summary row for session listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: String,
    pub message_count: usize,
}

pub struct SessionStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl SessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, lock: Mutex::new(()) }
    }

    /// Fresh 32-hex session id.
    pub fn new_session_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Validate a caller-supplied session id (hex uuid form only).
    pub fn is_valid_id(session_id: &str) -> bool {
        SAFE_SESSION_ID.is_match(session_id)
    }

    /// Append one message; the session file is created on first write.
    /// Failures are logged and swallowed (persistence is best-effort).
    pub fn save_message(&self, session_id: &str, role: &str, content: &str, meta: Value) {
        if !Self::is_valid_id(session_id) || content.is_empty() {
            return;
        }
        let _guard = self.lock.lock();
        let mut session = self.load(session_id).unwrap_or_else(|| Session {
            session_id: session_id.to_owned(),
            created_at: Utc::now().to_rfc3339(),
            messages: Vec::new(),
        });
        session.messages.push(SessionMessage {
            role: role.to_owned(),
            content: content.to_owned(),
            ts: Utc::now().to_rfc3339(),
            meta,
        });
        if let Err(err) = fs::create_dir_all(&self.dir) {
            tracing::warn!(%err, "session dir create failed");
            return;
        }
        let path = self.dir.join(format!("{session_id}.json"));
        match serde_json::to_string_pretty(&session) {
            Ok(json) => {
                if let Err(err) = fs::write(path, json) {
                    tracing::warn!(%err, "session write failed");
                }
            }
            Err(err) => tracing::warn!(%err, "session serialise failed"),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        if !Self::is_valid_id(session_id) {
            return None;
        }
        self.load(session_id)
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<SessionSummary> = entries
            .flatten()
            .filter_map(|e| {
                let raw = fs::read_to_string(e.path()).ok()?;
                let session: Session = serde_json::from_str(&raw).ok()?;
                Some(SessionSummary {
                    session_id: session.session_id,
                    created_at: session.created_at,
                    message_count: session.messages.len(),
                })
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn delete(&self, session_id: &str) -> bool {
        if !Self::is_valid_id(session_id) {
            return false;
        }
        let _guard = self.lock.lock();
        fs::remove_file(self.dir.join(format!("{session_id}.json"))).is_ok()
    }

    fn load(&self, session_id: &str) -> Option<Session> {
        let raw = fs::read_to_string(self.dir.join(format!("{session_id}.json"))).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions"))
    }

    #[test]
    fn new_ids_validate() {
        let id = SessionStore::new_session_id();
        assert!(SessionStore::is_valid_id(&id));
        assert!(!SessionStore::is_valid_id("../../etc/passwd"));
        assert!(!SessionStore::is_valid_id("short"));
    }

    #[test]
    fn messages_accumulate_in_order() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = SessionStore::new_session_id();
        s.save_message(&id, "user", "hello", json!({}));
        s.save_message(&id, "assistant", "hi there", json!({"provider": "openai"}));

        let session = s.get(&id).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, "user");
        assert_eq!(session.messages[1].meta["provider"], "openai");
    }

    #[test]
    fn invalid_ids_and_empty_content_are_ignored() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save_message("not-a-session", "user", "x", json!({}));
        let id = SessionStore::new_session_id();
        s.save_message(&id, "user", "", json!({}));
        assert!(s.get(&id).is_none());
        assert!(s.list().is_empty());
    }

    #[test]
    fn list_and_delete() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let id = SessionStore::new_session_id();
        s.save_message(&id, "user", "hello", json!({}));
        let listed = s.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].message_count, 1);
        assert!(s.delete(&id));
        assert!(!s.delete(&id));
        assert!(s.get(&id).is_none());
    }
}
