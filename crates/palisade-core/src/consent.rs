//! Consent / context-sharing timeline.
//!
//! Append-only JSONL record of every context-share event.  Only the field
//! *name* inventory is logged (never field values) so the timeline stays
//! meaningful without becoming a second copy of the user's data.
//!
//! The module also implements the data-subject rights over that file:
//! a complete per-actor export (GDPR Art. 15) and erasure (Art. 17).

use std::{fs, io::Write as _, path::PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One context-share event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentEntry {
    pub ts: String,
    pub url: String,
    pub origin: String,
    pub actor: String,
    /// Input-field names included in the shared snapshot.
    pub fields: Vec<String>,
    /// Field names redacted before sharing.
    pub redacted: Vec<String>,
    pub selected_text_len: usize,
    pub title: String,
}

/// Filters for [`ConsentLog::timeline`].
#[derive(Debug, Clone, Default)]
pub struct TimelineQuery {
    pub origin: Option<String>,
    pub actor: Option<String>,
    pub limit: usize,
}

pub struct ConsentLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConsentLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    /// Record a share event.  `origin` falls back to the scheme+host of
    /// `url` when empty.  Write failures are swallowed; consent logging
    /// must never break the share itself.
    pub fn log_share(
        &self,
        url: &str,
        origin: &str,
        actor: Option<&str>,
        fields: Vec<String>,
        redacted: Vec<String>,
        selected_text_len: usize,
        title: &str,
    ) -> ConsentEntry {
        let origin = if origin.is_empty() { derive_origin(url) } else { origin.to_owned() };
        let entry = ConsentEntry {
            ts: Utc::now().to_rfc3339(),
            url: url.to_owned(),
            origin,
            actor: actor.unwrap_or("anonymous").to_owned(),
            fields,
            redacted,
            selected_text_len,
            title: title.to_owned(),
        };
        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(line) = serde_json::to_string(&entry) {
            let res = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .and_then(|mut f| writeln!(f, "{line}"));
            if let Err(err) = res {
                tracing::warn!(%err, "consent timeline write failed");
            }
        }
        entry
    }

    /// Entries matching the query, newest first, bounded by `limit`.
    pub fn timeline(&self, query: &TimelineQuery) -> Vec<ConsentEntry> {
        let limit = if query.limit == 0 { 100 } else { query.limit };
        let mut entries: Vec<ConsentEntry> = self
            .read_entries()
            .into_iter()
            .filter(|e| query.origin.as_deref().is_none_or(|o| e.origin == o))
            .filter(|e| query.actor.as_deref().is_none_or(|a| e.actor == a))
            .collect();
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    /// All entries for `actor`, oldest first and unbounded, so the export
    /// is complete.
    pub fn export_actor(&self, actor: &str) -> Vec<ConsentEntry> {
        self.read_entries().into_iter().filter(|e| e.actor == actor).collect()
    }

    /// Rewrite the timeline without `actor`'s entries.  Returns the count
    /// removed.
    pub fn erase_actor(&self, actor: &str) -> usize {
        let _guard = self.lock.lock();
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        let mut kept = Vec::new();
        let mut removed = 0;
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<ConsentEntry>(line) {
                Ok(entry) if entry.actor == actor => removed += 1,
                _ => kept.push(line.to_owned()),
            }
        }
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        if let Err(err) = fs::write(&self.path, body) {
            tracing::warn!(%err, "consent timeline rewrite failed");
        }
        removed
    }

    /// Remove entries, optionally only those for one origin.  Returns the
    /// count removed.
    pub fn clear(&self, origin: Option<&str>) -> usize {
        let _guard = self.lock.lock();
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        match origin {
            None => {
                let removed = raw.lines().filter(|l| !l.trim().is_empty()).count();
                let _ = fs::write(&self.path, "");
                removed
            }
            Some(origin) => {
                let mut kept = Vec::new();
                let mut removed = 0;
                for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<ConsentEntry>(line) {
                        Ok(entry) if entry.origin == origin => removed += 1,
                        _ => kept.push(line.to_owned()),
                    }
                }
                let mut body = kept.join("\n");
                if !body.is_empty() {
                    body.push('\n');
                }
                let _ = fs::write(&self.path, body);
                removed
            }
        }
    }

    fn read_entries(&self) -> Vec<ConsentEntry> {
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}

/// Extract the logged snapshot shape: field names + selected-text length.
/// Values are deliberately discarded here, before anything touches disk.
pub fn snapshot_inventory(snapshot: &Value) -> (Vec<String>, usize) {
    let fields = snapshot
        .get("inputs")
        .and_then(Value::as_array)
        .map(|inputs| {
            inputs
                .iter()
                .filter_map(Value::as_object)
                .map(|inp| {
                    inp.get("name")
                        .or_else(|| inp.get("id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_owned()
                })
                .collect()
        })
        .unwrap_or_default();
    let selected_len = snapshot
        .get("selected_text")
        .and_then(Value::as_str)
        .map(str::len)
        .unwrap_or(0);
    (fields, selected_len)
}

fn derive_origin(url: &str) -> String {
    // scheme://host[:port] without pulling in a URL crate for one field.
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        let host_end = rest.find('/').unwrap_or(rest.len());
        if host_end > 0 {
            return format!("{}{}", &url[..scheme_end + 3], &rest[..host_end]);
        }
    }
    url.to_owned()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn log(dir: &TempDir) -> ConsentLog {
        ConsentLog::new(dir.path().join("consent_timeline.jsonl"))
    }

    fn share(l: &ConsentLog, actor: &str, origin: &str) {
        l.log_share(
            &format!("{origin}/login"),
            origin,
            Some(actor),
            vec!["username".to_owned(), "password".to_owned()],
            vec!["password".to_owned()],
            12,
            "Login",
        );
    }

    #[test]
    fn entries_log_field_names_only() {
        let dir = TempDir::new().unwrap();
        let l = log(&dir);
        let entry = l.log_share(
            "https://example.com/login",
            "",
            Some("abc123"),
            vec!["card_number".to_owned()],
            vec![],
            0,
            "Checkout",
        );
        assert_eq!(entry.origin, "https://example.com");
        assert_eq!(entry.fields, vec!["card_number"]);
        let raw = fs::read_to_string(dir.path().join("consent_timeline.jsonl")).unwrap();
        assert!(raw.contains("card_number"));
    }

    #[test]
    fn timeline_is_newest_first_with_filters() {
        let dir = TempDir::new().unwrap();
        let l = log(&dir);
        share(&l, "alice", "https://a.example");
        share(&l, "bob", "https://b.example");
        share(&l, "alice", "https://b.example");

        let all = l.timeline(&TimelineQuery::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].actor, "alice");
        assert_eq!(all[0].origin, "https://b.example");

        let alice = l.timeline(&TimelineQuery {
            actor: Some("alice".to_owned()),
            ..Default::default()
        });
        assert_eq!(alice.len(), 2);

        let b_origin = l.timeline(&TimelineQuery {
            origin: Some("https://b.example".to_owned()),
            limit: 1,
            ..Default::default()
        });
        assert_eq!(b_origin.len(), 1);
    }

    #[test]
    fn export_actor_is_oldest_first_and_complete() {
        let dir = TempDir::new().unwrap();
        let l = log(&dir);
        for _ in 0..150 {
            share(&l, "alice", "https://a.example");
        }
        share(&l, "bob", "https://a.example");
        let export = l.export_actor("alice");
        assert_eq!(export.len(), 150, "export is unbounded");
        assert!(export[0].ts <= export[149].ts);
    }

    #[test]
    fn erase_actor_rewrites_file() {
        let dir = TempDir::new().unwrap();
        let l = log(&dir);
        share(&l, "alice", "https://a.example");
        share(&l, "bob", "https://a.example");
        share(&l, "alice", "https://b.example");

        assert_eq!(l.erase_actor("alice"), 2);
        assert_eq!(l.erase_actor("alice"), 0);
        let remaining = l.timeline(&TimelineQuery::default());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].actor, "bob");
    }

    #[test]
    fn clear_by_origin_and_wholesale() {
        let dir = TempDir::new().unwrap();
        let l = log(&dir);
        share(&l, "a", "https://x.example");
        share(&l, "b", "https://y.example");
        assert_eq!(l.clear(Some("https://x.example")), 1);
        assert_eq!(l.timeline(&TimelineQuery::default()).len(), 1);
        assert_eq!(l.clear(None), 1);
        assert!(l.timeline(&TimelineQuery::default()).is_empty());
    }

    #[test]
    fn snapshot_inventory_extracts_names_not_values() {
        let snap = json!({
            "title": "Login",
            "inputs": [
                {"name": "user", "value": "SECRET"},
                {"id": "pw-field", "value": "SECRET2"},
                {"value": "anonymous-field"},
            ],
            "selected_text": "hello world",
        });
        let (fields, selected) = snapshot_inventory(&snap);
        assert_eq!(fields, vec!["user", "pw-field", ""]);
        assert_eq!(selected, 11);
    }
}
