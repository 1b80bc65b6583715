//! Opaque bearer tokens and the persistent revocation set.
//!
//! Access and refresh tokens are URL-safe random strings held in in-memory
//! maps with epoch-second expiries.  Revocation stores SHA-256 hashes of
//! token strings (never the tokens themselves) in a JSON file so a revoked
//! token stays dead across restarts; entries carry the token's natural
//! expiry and prune themselves lazily.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

const ACCESS_TOKEN_BYTES: usize = 24;
const REFRESH_TOKEN_BYTES: usize = 36;

#[derive(Debug, Clone)]
struct TokenInfo {
    username: String,
    expires: u64,
}

/// Access + refresh pair returned on login.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TokenStore {
    access: Mutex<HashMap<String, TokenInfo>>,
    refresh: Mutex<HashMap<String, TokenInfo>>,
    /// sha256-hex → expiry epoch seconds.
    revoked: Mutex<HashMap<String, u64>>,
    revoked_path: PathBuf,
    access_ttl: u64,
    refresh_ttl: u64,
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

impl TokenStore {
    /// Load the revocation set from `revoked_path`, dropping entries whose
    /// expiry already passed.
    pub fn new(revoked_path: PathBuf, access_ttl: u64, refresh_ttl: u64) -> Self {
        let now = now_epoch();
        let revoked: HashMap<String, u64> = fs::read_to_string(&revoked_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<HashMap<String, u64>>(&raw).ok())
            .map(|m| m.into_iter().filter(|(_, exp)| *exp > now).collect())
            .unwrap_or_default();
        Self {
            access: Mutex::new(HashMap::new()),
            refresh: Mutex::new(HashMap::new()),
            revoked: Mutex::new(revoked),
            revoked_path,
            access_ttl,
            refresh_ttl,
        }
    }

    /// Mint an access + refresh pair for `username`.
    pub fn issue_pair(&self, username: &str) -> TokenPair {
        let now = now_epoch();
        let access_token = random_token(ACCESS_TOKEN_BYTES);
        let refresh_token = random_token(REFRESH_TOKEN_BYTES);
        self.access.lock().insert(access_token.clone(), TokenInfo {
            username: username.to_owned(),
            expires: now + self.access_ttl,
        });
        self.refresh.lock().insert(refresh_token.clone(), TokenInfo {
            username: username.to_owned(),
            expires: now + self.refresh_ttl,
        });
        TokenPair { access_token, refresh_token }
    }

    /// Mint a long-lived access token (bootstrap path).
    pub fn issue_access_with_ttl(&self, username: &str, ttl: u64) -> String {
        let token = random_token(ACCESS_TOKEN_BYTES);
        self.access.lock().insert(token.clone(), TokenInfo {
            username: username.to_owned(),
            expires: now_epoch() + ttl,
        });
        token
    }

    /// Resolve an access token to its username.  Revocation is checked
    /// first; expired tokens are dropped on touch.
    pub fn resolve_access(&self, token: &str) -> Option<String> {
        if self.is_revoked(token) {
            return None;
        }
        let mut access = self.access.lock();
        let info = access.get(token)?.clone();
        if now_epoch() > info.expires {
            access.remove(token);
            return None;
        }
        Some(info.username)
    }

    /// Exchange a refresh token for a new access token.
    pub fn refresh_access(&self, refresh_token: &str) -> Option<String> {
        if self.is_revoked(refresh_token) {
            return None;
        }
        let username = {
            let mut refresh = self.refresh.lock();
            let info = refresh.get(refresh_token)?.clone();
            if now_epoch() > info.expires {
                refresh.remove(refresh_token);
                return None;
            }
            info.username
        };
        let token = random_token(ACCESS_TOKEN_BYTES);
        self.access.lock().insert(token.clone(), TokenInfo {
            username,
            expires: now_epoch() + self.access_ttl,
        });
        Some(token)
    }

    /// Revoke either kind of token.  Returns `true` when a live token was
    /// removed; the revocation entry is written regardless so unknown
    /// tokens can't be replayed later.
    pub fn revoke(&self, token: &str) -> bool {
        let mut removed = false;
        let mut expiry = 0u64;
        if let Some(info) = self.access.lock().remove(token) {
            expiry = info.expires;
            removed = true;
        }
        if let Some(info) = self.refresh.lock().remove(token) {
            expiry = expiry.max(info.expires);
            removed = true;
        }
        if expiry == 0 {
            // Worst-case lifetime for tokens we never issued or already lost.
            expiry = now_epoch() + self.refresh_ttl;
        }
        {
            let mut revoked = self.revoked.lock();
            revoked.insert(token_hash(token), expiry);
            self.persist_revoked(&revoked);
        }
        removed
    }

    fn is_revoked(&self, token: &str) -> bool {
        let hash = token_hash(token);
        let mut revoked = self.revoked.lock();
        match revoked.get(&hash) {
            Some(exp) if now_epoch() > *exp => {
                // Past its natural lifetime; self-prune.
                revoked.remove(&hash);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn persist_revoked(&self, revoked: &HashMap<String, u64>) {
        let now = now_epoch();
        let live: HashMap<&String, &u64> =
            revoked.iter().filter(|(_, exp)| **exp > now).collect();
        if let Some(parent) = self.revoked_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string_pretty(&live) {
            if let Err(err) = fs::write(&self.revoked_path, json) {
                tracing::warn!(%err, "failed to persist token revocation set");
            }
        }
    }
}
