//! The composition root.
//!
//! Every subsystem is an explicit service value owned by [`AppState`];
//! nothing is a process global, so tests build fresh states against temp
//! directories and the daemon builds exactly one.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    agent::{ApprovalGate, ToolLoopEngine},
    audit::AuditLog,
    auth::{AuthService, tokens::TokenStore},
    capability::{CapabilityVerifier, ManifestRegistry},
    config::GatewayConfig,
    consent::ConsentLog,
    filter::ContentFilter,
    memory::AgentMemoryStore,
    monitor::{AlertState, ApprovalConfigState, NoWorkerProbe, WorkerProbe},
    plugins::PluginLoader,
    providers::{
        AdapterRegistry,
        adapters::{AnthropicAdapter, OllamaAdapter, OpenAiCompatibleAdapter},
        failover::FailoverRouter,
        keys::ProviderKeyStore,
        outbound::OutboundPolicy,
    },
    ratelimit::RateLimiter,
    scheduler::TaskScheduler,
    sessions::SessionStore,
    supervisor::{Supervisor, SupervisorError, default_tool_schema},
    telemetry::Telemetry,
    tools::{ToolRegistry, registry::EchoTool},
    webhooks::WebhookDispatcher,
};

// ─── Kill switch ─────────────────────────────────────────────────────────────

/// Emergency stop: while armed, every `/tools/call` is refused with 503.
/// Chat and admin endpoints stay available.
pub struct KillSwitch {
    active: AtomicBool,
    reason: Mutex<String>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self { active: AtomicBool::new(false), reason: Mutex::new(String::new()) }
    }

    pub fn arm(&self, reason: &str) {
        *self.reason.lock() = reason.to_owned();
        self.active.store(true, Ordering::SeqCst);
    }

    /// Disarm; returns the previous reason.
    pub fn disarm(&self) -> String {
        self.active.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.reason.lock())
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> String {
        self.reason.lock().clone()
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Per-tool stats ──────────────────────────────────────────────────────────

/// Bounded duration samples retained per tool for the p50 summary.
const DURATION_SAMPLES_MAX: usize = 256;

#[derive(Default)]
struct ToolStat {
    calls: u64,
    total_seconds: f64,
    samples: Vec<f64>,
}

/// In-process per-tool invocation counters and latency summaries backing
/// `GET /admin/metrics/tools`.
#[derive(Default)]
pub struct ToolStats {
    inner: Mutex<HashMap<String, ToolStat>>,
}

impl ToolStats {
    pub fn observe(&self, tool: &str, seconds: f64) {
        let mut inner = self.inner.lock();
        let stat = inner.entry(tool.to_owned()).or_default();
        stat.calls += 1;
        stat.total_seconds += seconds;
        if stat.samples.len() == DURATION_SAMPLES_MAX {
            stat.samples.remove(0);
        }
        stat.samples.push(seconds);
    }

    /// Rows sorted by call count (descending) plus the overall total.
    pub fn summary(&self) -> (Vec<Value>, u64) {
        let inner = self.inner.lock();
        let mut rows: Vec<Value> = inner
            .iter()
            .map(|(tool, stat)| {
                let mut sorted = stat.samples.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let p50 = sorted.get((sorted.len() / 2).saturating_sub(1)).copied();
                serde_json::json!({
                    "tool": tool,
                    "calls": stat.calls,
                    "p50_seconds": p50,
                    "mean_seconds": if stat.calls > 0 {
                        Some(stat.total_seconds / stat.calls as f64)
                    } else {
                        None
                    },
                })
            })
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r["calls"].as_u64().unwrap_or(0)));
        let total = inner.values().map(|s| s.calls).sum();
        (rows, total)
    }

    pub fn total_calls(&self) -> u64 {
        self.inner.lock().values().map(|s| s.calls).sum()
    }
}

/// Per-model token usage accumulated from provider `usage` payloads.
#[derive(Default)]
pub struct TokenUsage {
    inner: Mutex<HashMap<String, (u64, u64, u64)>>,
}

impl TokenUsage {
    pub fn record(&self, model: &str, usage: &Value) {
        let prompt = usage["prompt_tokens"]
            .as_u64()
            .or_else(|| usage["input_tokens"].as_u64())
            .unwrap_or(0);
        let completion = usage["completion_tokens"]
            .as_u64()
            .or_else(|| usage["output_tokens"].as_u64())
            .unwrap_or(0);
        let mut inner = self.inner.lock();
        let entry = inner.entry(model.to_owned()).or_default();
        entry.0 += prompt;
        entry.1 += completion;
        entry.2 += 1;
    }

    pub fn snapshot(&self, model: Option<&str>) -> Value {
        let inner = self.inner.lock();
        let rows: serde_json::Map<String, Value> = inner
            .iter()
            .filter(|(m, _)| model.is_none_or(|want| want == m.as_str()))
            .map(|(m, (p, c, r))| {
                (
                    m.clone(),
                    serde_json::json!({
                        "prompt_tokens": p,
                        "completion_tokens": c,
                        "requests": r,
                    }),
                )
            })
            .collect();
        Value::Object(rows)
    }
}

// ─── AppState ────────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: GatewayConfig,
    pub audit: Arc<AuditLog>,
    pub filter: Arc<ContentFilter>,
    pub manifests: Arc<ManifestRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub auth: Arc<AuthService>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub scheduler: Arc<TaskScheduler>,
    pub agent_memory: Arc<AgentMemoryStore>,
    pub consent: Arc<ConsentLog>,
    pub provider_keys: Arc<ProviderKeyStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub failover: Arc<FailoverRouter>,
    pub tools: Arc<ToolRegistry>,
    pub engine: Arc<ToolLoopEngine>,
    pub sessions: Arc<SessionStore>,
    /// Relevant-memory hook for system-prompt assembly; `None` in a bare
    /// deployment.
    pub relevant_memory: Option<Arc<dyn crate::agent::RelevantMemory>>,
    pub alert_state: Arc<AlertState>,
    pub approval_config: Arc<ApprovalConfigState>,
    pub kill_switch: Arc<KillSwitch>,
    pub telemetry: Arc<Telemetry>,
    pub worker_probe: Arc<dyn WorkerProbe>,
    pub tool_stats: Arc<ToolStats>,
    pub token_usage: Arc<TokenUsage>,
    pub started_at: Instant,
}

impl AppState {
    /// Wire every service from the boot configuration.
    pub fn from_config(config: GatewayConfig) -> Result<Arc<Self>, SupervisorError> {
        let telemetry = Arc::new(Telemetry::install());

        let audit = Arc::new(AuditLog::new(config.audit_log_file(), config.audit_key));
        let filter = Arc::new(ContentFilter::new(
            config.content_filter_file(),
            config.content_filter_patterns.clone(),
        ));
        let manifests = Arc::new(ManifestRegistry::new(config.manifest_dir()));
        let verifier = Arc::new(CapabilityVerifier::from_allow_spec(
            Arc::clone(&manifests),
            config.allowed_caps.as_deref(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            default_tool_schema(),
            config.schema_dir(),
            verifier,
            Arc::clone(&filter),
        )?);

        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let tokens = TokenStore::new(
            config.revoked_tokens_file(),
            config.tokens.access_expire_seconds,
            config.tokens.refresh_expire_seconds,
        );
        let auth = Arc::new(AuthService::new(config.users_file(), tokens));
        auth.ensure_default_admin(config.admin_password.as_deref());

        let webhooks = Arc::new(WebhookDispatcher::new(
            config.webhooks_file(),
            config.webhooks.clone(),
        ));
        let scheduler = TaskScheduler::new(config.schedule_file());
        {
            let supervisor = Arc::clone(&supervisor);
            scheduler.set_executor(Arc::new(move |payload: &Value| {
                Ok(supervisor.process_call(payload).to_value())
            }));
        }

        let agent_memory = Arc::new(AgentMemoryStore::new(config.memory_dir()));
        let consent = Arc::new(ConsentLog::new(config.consent_timeline_file()));
        let provider_keys = Arc::new(ProviderKeyStore::new(config.provider_keys_file()));

        let outbound = Arc::new(OutboundPolicy::new(config.outbound_allowlist.clone()));
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(OpenAiCompatibleAdapter::openai(
            Arc::clone(&provider_keys),
            Arc::clone(&outbound),
        )));
        adapters.register(Arc::new(OpenAiCompatibleAdapter::openrouter(
            Arc::clone(&provider_keys),
            Arc::clone(&outbound),
        )));
        adapters.register(Arc::new(AnthropicAdapter::new(
            Arc::clone(&provider_keys),
            Arc::clone(&outbound),
        )));
        adapters.register(Arc::new(OllamaAdapter::new(Arc::clone(&outbound))));
        let adapters = Arc::new(adapters);
        let failover = Arc::new(FailoverRouter::new(Arc::clone(&adapters)));

        let tools = Arc::new(ToolRegistry::new());
        tools.register(Arc::new(EchoTool));
        PluginLoader::new(config.plugins_dir()).load_all(&tools);
        let engine = Arc::new(ToolLoopEngine::new(
            Arc::clone(&tools),
            Arc::new(ApprovalGate::new()),
        ));

        let sessions = Arc::new(SessionStore::new(config.sessions_dir()));
        let alert_state = Arc::new(AlertState::new(config.alerts.clone()));
        let approval_config = Arc::new(ApprovalConfigState::new(config.approvals.clone()));

        Ok(Arc::new(Self {
            config,
            audit,
            filter,
            manifests,
            supervisor,
            rate_limiter,
            auth,
            webhooks,
            scheduler,
            agent_memory,
            consent,
            provider_keys,
            adapters,
            failover,
            tools,
            engine,
            sessions,
            relevant_memory: None,
            alert_state,
            approval_config,
            kill_switch: Arc::new(KillSwitch::new()),
            telemetry,
            worker_probe: Arc::new(NoWorkerProbe),
            tool_stats: Arc::new(ToolStats::default()),
            token_usage: Arc::new(TokenUsage::default()),
            started_at: Instant::now(),
        }))
    }

    /// Start the background daemons (scheduler, reaper, alert monitor).
    pub fn start_background(self: &Arc<Self>) {
        self.scheduler.start();
        crate::monitor::spawn_approval_reaper(
            Arc::clone(&self.supervisor),
            Arc::clone(&self.webhooks),
            Arc::clone(&self.audit),
            Arc::clone(&self.approval_config),
        );
        crate::monitor::spawn_alert_monitor(
            Arc::clone(&self.worker_probe),
            Arc::clone(&self.webhooks),
            Arc::clone(&self.audit),
            Arc::clone(&self.alert_state),
        );
    }

    pub fn uptime_seconds(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }
}
