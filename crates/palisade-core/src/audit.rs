//! Append-only audit log.
//!
//! One JSON object per line: `{ts, event, actor, details}`.  When a 32-byte
//! key is configured every line is stored as base64(nonce‖ciphertext) under
//! AES-256-GCM instead of plaintext.  Reads decrypt best-effort so files
//! containing a mix of plaintext and ciphertext lines (mid-migration)
//! remain exportable.
//!
//! Writes must never fail the request that triggered them: I/O errors are
//! logged and swallowed.

use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::PathBuf,
};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub event: String,
    pub actor: Option<String>,
    pub details: Value,
}

/// Filters applied when exporting entries (AND semantics).
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Maximum lines read from the end of the file.
    pub tail: usize,
    /// Case-insensitive substring match on `actor`.
    pub actor: Option<String>,
    /// Case-insensitive substring match on `event`.
    pub event: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

/// Append-only audit log with optional at-rest encryption.
pub struct AuditLog {
    path: PathBuf,
    key: Option<[u8; 32]>,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf, key: Option<[u8; 32]>) -> Self {
        Self { path, key, write_lock: Mutex::new(()) }
    }

    /// Append one entry.  Errors are swallowed after logging so audit I/O
    /// can never fail the request being audited.
    pub fn record(&self, event: &str, actor: Option<&str>, details: Value) {
        let entry = AuditEntry {
            ts: Utc::now().to_rfc3339(),
            event: event.to_owned(),
            actor: actor.map(str::to_owned),
            details,
        };
        let Ok(mut line) = serde_json::to_string(&entry) else {
            return;
        };
        if let Some(key) = &self.key {
            match encrypt_line(&line, key) {
                Ok(enc) => line = enc,
                Err(err) => {
                    tracing::error!(%err, "audit encryption failed; entry dropped");
                    return;
                }
            }
        }
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let res = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(err) = res {
            tracing::warn!(%err, path = %self.path.display(), "audit write failed");
        }
    }

    /// Read entries matching `filter`, oldest-first within the tail window.
    ///
    /// Undecodable lines are surfaced as `{"raw": "<line>"}` entries so the
    /// export is complete even over corrupted or foreign lines.
    pub fn export(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let raw = fs::read_to_string(&self.path).unwrap_or_default();
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        let tail = if filter.tail == 0 { lines.len() } else { filter.tail };
        let start = lines.len().saturating_sub(tail);

        let actor_f = filter.actor.as_deref().map(str::to_lowercase);
        let event_f = filter.event.as_deref().map(str::to_lowercase);

        let mut out = Vec::new();
        for line in &lines[start..] {
            let mut text = (*line).to_owned();
            if let Some(key) = &self.key {
                // Plaintext fallback keeps mixed files readable.
                if let Ok(dec) = decrypt_line(&text, key) {
                    text = dec;
                }
            }
            let entry: AuditEntry = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(_) => AuditEntry {
                    ts: String::new(),
                    event: String::new(),
                    actor: None,
                    details: serde_json::json!({ "raw": text }),
                },
            };
            if let Some(f) = &actor_f {
                let actor = entry.actor.as_deref().unwrap_or_default().to_lowercase();
                if !actor.contains(f) {
                    continue;
                }
            }
            if let Some(f) = &event_f {
                if !entry.event.to_lowercase().contains(f) {
                    continue;
                }
            }
            if filter.since.is_some() || filter.until.is_some() {
                // Entries with unparseable timestamps pass through.
                if let Ok(ts) = DateTime::parse_from_rfc3339(&entry.ts) {
                    let ts = ts.with_timezone(&Utc);
                    if filter.since.is_some_and(|s| ts < s) {
                        continue;
                    }
                    if filter.until.is_some_and(|u| ts > u) {
                        continue;
                    }
                }
            }
            out.push(entry);
        }
        out
    }

    /// Render matching entries as CSV with header `ts,event,actor,details`.
    pub fn export_csv(&self, filter: &AuditFilter) -> String {
        let mut out = String::from("ts,event,actor,details\n");
        for e in self.export(filter) {
            let details = serde_json::to_string(&e.details).unwrap_or_default();
            out.push_str(&csv_row(&[
                &e.ts,
                &e.event,
                e.actor.as_deref().unwrap_or_default(),
                &details,
            ]));
        }
        out
    }
}

fn csv_row(fields: &[&str]) -> String {
    let escaped: Vec<String> = fields
        .iter()
        .map(|f| {
            if f.contains([',', '"', '\n']) {
                format!("\"{}\"", f.replace('"', "\"\""))
            } else {
                (*f).to_owned()
            }
        })
        .collect();
    format!("{}\n", escaped.join(","))
}

// ─── Line encryption ─────────────────────────────────────────────────────────

fn encrypt_line(line: &str, key: &[u8; 32]) -> Result<String, String> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), line.as_bytes())
        .map_err(|e| e.to_string())?;
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ct);
    Ok(B64.encode(blob))
}

fn decrypt_line(enc: &str, key: &[u8; 32]) -> Result<String, String> {
    let blob = B64.decode(enc.trim()).map_err(|e| e.to_string())?;
    if blob.len() < 12 {
        return Err("ciphertext too short".to_owned());
    }
    let (nonce, ct) = blob.split_at(12);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| e.to_string())?;
    let pt = cipher
        .decrypt(Nonce::from_slice(nonce), ct)
        .map_err(|e| e.to_string())?;
    String::from_utf8(pt).map_err(|e| e.to_string())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
