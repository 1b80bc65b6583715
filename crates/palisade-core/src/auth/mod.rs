//! Users, passwords, and bearer-token authentication.
//!
//! Passwords are hashed with PBKDF2-HMAC-SHA256 (100 000 iterations,
//! 16-byte random salt).  When the `keyring` feature is enabled the
//! salt+hash pair is stored in the OS keychain and the users file only
//! carries roles; on headless systems the pair falls back to the file.
//!
//! The built-in `admin` user is created on first boot from
//! `PALISADE_ADMIN_PASSWORD` and cannot be deleted through the API.

pub mod tokens;

use std::{collections::BTreeMap, fs, path::PathBuf};

use parking_lot::Mutex;
use pbkdf2::pbkdf2_hmac_array;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use tokens::{TokenPair, TokenStore};

const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_BYTES: usize = 16;

#[cfg(feature = "keyring")]
const KEYRING_SERVICE: &str = "palisade-gateway-users";

// ─── Records ─────────────────────────────────────────────────────────────────

/// On-disk user record.  `salt`/`hash` are absent when the secret lives in
/// the OS keychain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct UserRecord {
    #[serde(default)]
    roles: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hash: Option<String>,
    /// `None` → no restriction; all tools permitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    allowed_tools: Option<Vec<String>>,
}

/// Resolved identity attached to an authenticated request.
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub username: String,
    pub roles: Vec<String>,
    pub allowed_tools: Option<Vec<String>>,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == "admin")
    }
}

/// Public summary row for `GET /admin/users`.
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub username: String,
    pub roles: Vec<String>,
    pub has_tool_restrictions: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    salt: String,
    hash: String,
}

// ─── AuthService ─────────────────────────────────────────────────────────────

pub struct AuthService {
    users_path: PathBuf,
    users_lock: Mutex<()>,
    pub tokens: TokenStore,
}

impl AuthService {
    pub fn new(users_path: PathBuf, tokens: TokenStore) -> Self {
        Self { users_path, users_lock: Mutex::new(()), tokens }
    }

    /// Create the default `admin` user if it does not exist yet.
    pub fn ensure_default_admin(&self, password: Option<&str>) {
        if self.load_users().contains_key("admin") {
            return;
        }
        if let Some(pw) = password {
            self.create_user("admin", pw, &["admin".to_owned()]);
        }
    }

    /// Whether any user exists (drives the first-run setup endpoint).
    pub fn has_users(&self) -> bool {
        !self.load_users().is_empty()
    }

    /// Register a user.  Returns `false` when the name is taken.
    pub fn create_user(&self, username: &str, password: &str, roles: &[String]) -> bool {
        let _guard = self.users_lock.lock();
        let mut users = self.load_users();
        if users.contains_key(username) {
            return false;
        }
        let secret = hash_password(password);
        let mut record = UserRecord { roles: roles.to_vec(), ..UserRecord::default() };
        if !store_secret_in_keyring(username, &secret) {
            record.salt = Some(secret.salt.clone());
            record.hash = Some(secret.hash.clone());
        }
        users.insert(username.to_owned(), record);
        self.save_users(&users)
    }

    /// Verify credentials and mint a token pair.
    pub fn authenticate(&self, username: &str, password: &str) -> Option<TokenPair> {
        let users = self.load_users();
        let record = users.get(username)?;
        let secret = load_secret_from_keyring(username).or_else(|| {
            match (&record.salt, &record.hash) {
                (Some(salt), Some(hash)) => {
                    Some(StoredSecret { salt: salt.clone(), hash: hash.clone() })
                }
                _ => None,
            }
        })?;
        if !verify_password(password, &secret) {
            return None;
        }
        Some(self.tokens.issue_pair(username))
    }

    /// Resolve a bearer token to its user, applying revocation and expiry.
    pub fn user_for_token(&self, token: &str) -> Option<AuthUser> {
        let username = self.tokens.resolve_access(token)?;
        let users = self.load_users();
        let record = users.get(&username)?;
        Some(AuthUser {
            username,
            roles: record.roles.clone(),
            allowed_tools: record.allowed_tools.clone(),
        })
    }

    pub fn check_role(&self, token: &str, role: &str) -> bool {
        self.user_for_token(token)
            .is_some_and(|u| u.roles.iter().any(|r| r == role))
    }

    // ── User lifecycle ───────────────────────────────────────────────────

    pub fn list_users(&self) -> Vec<UserSummary> {
        self.load_users()
            .into_iter()
            .map(|(username, r)| UserSummary {
                username,
                roles: r.roles,
                has_tool_restrictions: r.allowed_tools.as_ref().is_some_and(|t| !t.is_empty()),
            })
            .collect()
    }

    /// Delete a user.  The built-in `admin` cannot be deleted.
    pub fn delete_user(&self, username: &str) -> bool {
        if username == "admin" {
            return false;
        }
        let _guard = self.users_lock.lock();
        let mut users = self.load_users();
        if users.remove(username).is_none() {
            return false;
        }
        delete_secret_from_keyring(username);
        self.save_users(&users)
    }

    pub fn change_password(&self, username: &str, new_password: &str) -> bool {
        let _guard = self.users_lock.lock();
        let mut users = self.load_users();
        let Some(record) = users.get_mut(username) else {
            return false;
        };
        let secret = hash_password(new_password);
        if store_secret_in_keyring(username, &secret) {
            // Keychain took it; make sure nothing stale is left in the file.
            record.salt = None;
            record.hash = None;
        } else {
            record.salt = Some(secret.salt.clone());
            record.hash = Some(secret.hash.clone());
        }
        self.save_users(&users)
    }

    // ── Per-user tool permissions ────────────────────────────────────────

    /// `None` means unrestricted.
    pub fn allowed_tools(&self, username: &str) -> Option<Vec<String>> {
        self.load_users().get(username).and_then(|r| r.allowed_tools.clone())
    }

    pub fn user_exists(&self, username: &str) -> bool {
        self.load_users().contains_key(username)
    }

    /// Persist the allow-list; empty or absent clears the restriction.
    pub fn set_allowed_tools(&self, username: &str, tools: Option<Vec<String>>) -> bool {
        let _guard = self.users_lock.lock();
        let mut users = self.load_users();
        let Some(record) = users.get_mut(username) else {
            return false;
        };
        record.allowed_tools = match tools {
            None => None,
            Some(t) if t.is_empty() => None,
            Some(mut t) => {
                t.sort();
                t.dedup();
                Some(t)
            }
        };
        self.save_users(&users)
    }

    // ── File I/O ─────────────────────────────────────────────────────────

    fn load_users(&self) -> BTreeMap<String, UserRecord> {
        fs::read_to_string(&self.users_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_users(&self, users: &BTreeMap<String, UserRecord>) -> bool {
        if let Some(parent) = self.users_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(users) {
            Ok(json) => fs::write(&self.users_path, json)
                .map_err(|err| tracing::warn!(%err, "failed to write users file"))
                .is_ok(),
            Err(_) => false,
        }
    }
}

// ─── Password hashing ────────────────────────────────────────────────────────

fn hash_password(password: &str) -> StoredSecret {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);
    let hash = pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, PBKDF2_ROUNDS);
    StoredSecret { salt: hex::encode(salt), hash: hex::encode(hash) }
}

fn verify_password(password: &str, secret: &StoredSecret) -> bool {
    let Ok(salt) = hex::decode(&secret.salt) else {
        return false;
    };
    let Ok(expected) = hex::decode(&secret.hash) else {
        return false;
    };
    let mut computed =
        pbkdf2_hmac_array::<Sha256, 32>(password.as_bytes(), &salt, PBKDF2_ROUNDS).to_vec();
    let ok = computed.ct_eq(&expected).into();
    computed.zeroize();
    ok
}

// ─── Keychain backend ────────────────────────────────────────────────────────

#[cfg(feature = "keyring")]
fn store_secret_in_keyring(username: &str, secret: &StoredSecret) -> bool {
    let Ok(json) = serde_json::to_string(secret) else {
        return false;
    };
    keyring::Entry::new(KEYRING_SERVICE, username)
        .and_then(|e| e.set_password(&json))
        .is_ok()
}

#[cfg(feature = "keyring")]
fn load_secret_from_keyring(username: &str) -> Option<StoredSecret> {
    let entry = keyring::Entry::new(KEYRING_SERVICE, username).ok()?;
    let json = entry.get_password().ok()?;
    serde_json::from_str(&json).ok()
}

#[cfg(feature = "keyring")]
fn delete_secret_from_keyring(username: &str) {
    if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, username) {
        let _ = entry.delete_credential();
    }
}

#[cfg(not(feature = "keyring"))]
fn store_secret_in_keyring(_username: &str, _secret: &StoredSecret) -> bool {
    false
}

#[cfg(not(feature = "keyring"))]
fn load_secret_from_keyring(_username: &str) -> Option<StoredSecret> {
    None
}

#[cfg(not(feature = "keyring"))]
fn delete_secret_from_keyring(_username: &str) {}

// ─── Tests ───────────────────────────────────────────────────────────────────
