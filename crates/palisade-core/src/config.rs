//! Environment-driven gateway configuration.
//!
//! All settings are read once at boot via [`GatewayConfig::from_env`]; the
//! handful that are runtime-mutable (rate limits, alert thresholds,
//! approval timeout, failover chain) seed their respective services and are
//! changed through the admin API afterwards, never through the environment.
//!
//! Every variable uses the `PALISADE_` prefix.  Persisted state lives under
//! a single state directory (`PALISADE_STATE_DIR`, defaulting to the
//! platform data dir, e.g. `~/.local/share/palisade`).

use std::{env, net::SocketAddr, path::PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

// ─── Sections ────────────────────────────────────────────────────────────────

/// Sliding-window rate-limit settings (per-IP and per-user).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub max_requests: usize,
    pub window_seconds: f64,
    pub burst: usize,
    pub user_max_requests: usize,
    pub user_window_seconds: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 60,
            window_seconds: 60.0,
            burst: 10,
            user_max_requests: 60,
            user_window_seconds: 60.0,
        }
    }
}

/// Alert-monitor thresholds.  A threshold of 0 disables that alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AlertSettings {
    pub approval_queue_threshold: usize,
    pub worker_check_interval_seconds: f64,
    pub validation_error_window_seconds: f64,
    pub validation_error_threshold: usize,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            approval_queue_threshold: 0,
            worker_check_interval_seconds: 60.0,
            validation_error_window_seconds: 60.0,
            validation_error_threshold: 0,
        }
    }
}

/// Approval-queue settings.  `timeout_seconds == 0` disables the reaper.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApprovalSettings {
    pub timeout_seconds: f64,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self { timeout_seconds: 0.0 }
    }
}

/// Webhook delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebhookSettings {
    pub timeout_seconds: f64,
    /// Total delivery attempts (initial + retries) per event.
    pub max_retries: u32,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self { timeout_seconds: 5.0, max_retries: 3 }
    }
}

/// Token lifetimes in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenSettings {
    pub access_expire_seconds: u64,
    pub refresh_expire_seconds: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            access_expire_seconds: 3600,
            refresh_expire_seconds: 7 * 24 * 3600,
        }
    }
}

// ─── GatewayConfig ───────────────────────────────────────────────────────────

/// Boot-time configuration for the whole gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Root directory for all persisted state.
    pub state_dir: PathBuf,
    /// Bind address for the HTTP surface.
    pub bind: SocketAddr,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Capability allow-set source string (comma list or `ALL`), if set.
    pub allowed_caps: Option<String>,
    /// Ephemeral content-filter deny patterns (comma-separated literals).
    pub content_filter_patterns: Vec<String>,
    /// 32-byte AES-256-GCM key for audit at-rest encryption, if configured.
    pub audit_key: Option<[u8; 32]>,
    /// Outbound provider origin allow-list override (comma list).  `None`
    /// (unset *or* whitespace-only) falls back to the built-in origins.
    pub outbound_allowlist: Option<Vec<String>>,
    /// One-time secret that lets an embedding shell mint an admin token.
    pub bootstrap_secret: Option<String>,
    /// Password for the default `admin` user created on first boot.
    pub admin_password: Option<String>,
    /// Page-context HTML truncation cap in bytes.
    pub page_html_cap: usize,
    pub rate_limit: RateLimitSettings,
    pub alerts: AlertSettings,
    pub approvals: ApprovalSettings,
    pub webhooks: WebhookSettings,
    pub tokens: TokenSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            bind: SocketAddr::from(([127, 0, 0, 1], 18890)),
            cors_origins: vec!["http://127.0.0.1:8080".to_owned()],
            allowed_caps: None,
            content_filter_patterns: Vec::new(),
            audit_key: None,
            outbound_allowlist: None,
            bootstrap_secret: None,
            admin_password: None,
            page_html_cap: 8 * 1024,
            rate_limit: RateLimitSettings::default(),
            alerts: AlertSettings::default(),
            approvals: ApprovalSettings::default(),
            webhooks: WebhookSettings::default(),
            tokens: TokenSettings::default(),
        }
    }
}

impl GatewayConfig {
    /// Build the configuration from `PALISADE_*` environment variables,
    /// falling back to defaults for anything unset.
    ///
    /// Returns an error only for values that are present but unusable
    /// (e.g. a malformed audit key); a blank environment always works.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(dir) = env_nonempty("PALISADE_STATE_DIR") {
            cfg.state_dir = PathBuf::from(dir);
        }
        if let Some(bind) = env_nonempty("PALISADE_BIND") {
            cfg.bind = bind
                .parse()
                .map_err(|_| ConfigError::Invalid("PALISADE_BIND", bind))?;
        }
        if let Some(raw) = env_nonempty("PALISADE_CORS_ORIGINS") {
            cfg.cors_origins = split_csv(&raw);
        }
        cfg.allowed_caps = env_nonempty("PALISADE_ALLOWED_CAPS");
        if let Some(raw) = env_nonempty("PALISADE_CONTENT_FILTER_PATTERNS") {
            cfg.content_filter_patterns = split_csv(&raw);
        }
        if let Some(raw) = env_nonempty("PALISADE_AUDIT_ENCRYPT_KEY") {
            cfg.audit_key = Some(parse_audit_key(&raw)?);
        }
        // Unset and whitespace-only both mean "use the built-in origins";
        // the distinction is deliberate and covered by tests.
        if let Ok(raw) = env::var("PALISADE_PROVIDER_OUTBOUND_ALLOWLIST") {
            let entries = split_csv(&raw);
            cfg.outbound_allowlist = if entries.is_empty() { None } else { Some(entries) };
        }
        cfg.bootstrap_secret = env_nonempty("PALISADE_BOOTSTRAP_SECRET");
        cfg.admin_password = env_nonempty("PALISADE_ADMIN_PASSWORD");
        if let Some(raw) = env_nonempty("PALISADE_PAGE_HTML_CAP") {
            cfg.page_html_cap = parse_num(&raw, "PALISADE_PAGE_HTML_CAP")?;
        }

        // Rate limits
        let rl = &mut cfg.rate_limit;
        if let Some(raw) = env_nonempty("PALISADE_RATE_LIMIT_ENABLED") {
            rl.enabled = !matches!(raw.to_lowercase().as_str(), "0" | "false" | "no");
        }
        if let Some(raw) = env_nonempty("PALISADE_RATE_LIMIT_REQUESTS") {
            rl.max_requests = parse_num(&raw, "PALISADE_RATE_LIMIT_REQUESTS")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_RATE_LIMIT_WINDOW") {
            rl.window_seconds = parse_num(&raw, "PALISADE_RATE_LIMIT_WINDOW")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_RATE_LIMIT_BURST") {
            rl.burst = parse_num(&raw, "PALISADE_RATE_LIMIT_BURST")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_USER_RATE_LIMIT_REQUESTS") {
            rl.user_max_requests = parse_num(&raw, "PALISADE_USER_RATE_LIMIT_REQUESTS")?;
        } else {
            rl.user_max_requests = rl.max_requests;
        }
        if let Some(raw) = env_nonempty("PALISADE_USER_RATE_LIMIT_WINDOW") {
            rl.user_window_seconds = parse_num(&raw, "PALISADE_USER_RATE_LIMIT_WINDOW")?;
        } else {
            rl.user_window_seconds = rl.window_seconds;
        }

        // Alerts
        let al = &mut cfg.alerts;
        if let Some(raw) = env_nonempty("PALISADE_APPROVAL_ALERT_THRESHOLD") {
            al.approval_queue_threshold = parse_num(&raw, "PALISADE_APPROVAL_ALERT_THRESHOLD")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_WORKER_CHECK_INTERVAL") {
            al.worker_check_interval_seconds = parse_num(&raw, "PALISADE_WORKER_CHECK_INTERVAL")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_VALIDATION_ERR_WINDOW") {
            al.validation_error_window_seconds = parse_num(&raw, "PALISADE_VALIDATION_ERR_WINDOW")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_VALIDATION_ERR_THRESHOLD") {
            al.validation_error_threshold = parse_num(&raw, "PALISADE_VALIDATION_ERR_THRESHOLD")?;
        }

        if let Some(raw) = env_nonempty("PALISADE_APPROVAL_TIMEOUT") {
            cfg.approvals.timeout_seconds = parse_num(&raw, "PALISADE_APPROVAL_TIMEOUT")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_WEBHOOK_TIMEOUT") {
            cfg.webhooks.timeout_seconds = parse_num(&raw, "PALISADE_WEBHOOK_TIMEOUT")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_WEBHOOK_MAX_RETRIES") {
            cfg.webhooks.max_retries = parse_num(&raw, "PALISADE_WEBHOOK_MAX_RETRIES")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_ACCESS_EXPIRE") {
            cfg.tokens.access_expire_seconds = parse_num(&raw, "PALISADE_ACCESS_EXPIRE")?;
        }
        if let Some(raw) = env_nonempty("PALISADE_REFRESH_EXPIRE") {
            cfg.tokens.refresh_expire_seconds = parse_num(&raw, "PALISADE_REFRESH_EXPIRE")?;
        }

        Ok(cfg)
    }

    // ── Derived paths ────────────────────────────────────────────────────

    pub fn users_file(&self) -> PathBuf {
        self.state_dir.join("users.json")
    }

    pub fn revoked_tokens_file(&self) -> PathBuf {
        self.state_dir.join("revoked_tokens.json")
    }

    pub fn audit_log_file(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }

    pub fn webhooks_file(&self) -> PathBuf {
        self.state_dir.join("webhooks.json")
    }

    pub fn schedule_file(&self) -> PathBuf {
        self.state_dir.join("schedule.json")
    }

    pub fn content_filter_file(&self) -> PathBuf {
        self.state_dir.join("content_filter_rules.json")
    }

    pub fn consent_timeline_file(&self) -> PathBuf {
        self.state_dir.join("consent_timeline.jsonl")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.state_dir.join("agent_memories")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.state_dir.join("manifests")
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.state_dir.join("schemas")
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn provider_keys_file(&self) -> PathBuf {
        self.state_dir.join("provider_keys.json")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.state_dir.join("plugins")
    }
}

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
    #[error("PALISADE_AUDIT_ENCRYPT_KEY must be 64 hex chars (32 bytes)")]
    BadAuditKey,
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn default_state_dir() -> PathBuf {
    ProjectDirs::from("com", "palisade-gw", "palisade")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".palisade"))
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_num<T: std::str::FromStr>(raw: &str, var: &'static str) -> Result<T, ConfigError> {
    raw.parse()
        .map_err(|_| ConfigError::Invalid(var, raw.to_owned()))
}

fn parse_audit_key(raw: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(raw).map_err(|_| ConfigError::BadAuditKey)?;
    bytes.try_into().map_err(|_| ConfigError::BadAuditKey)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
