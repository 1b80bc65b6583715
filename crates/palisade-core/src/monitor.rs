//! Background monitors: the approval-timeout reaper and the alert daemon.
//!
//! Both daemons are plain tokio tasks that catch nothing fatal: every
//! pass is self-contained and a failing pass only logs.  The single-pass
//! bodies are public so tests (and the admin "run now" paths) can drive
//! them without timers.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde_json::json;

use crate::{
    audit::AuditLog,
    config::{AlertSettings, ApprovalSettings},
    supervisor::Supervisor,
    webhooks::WebhookDispatcher,
};

/// Reaper cadence (fixed).
const REAPER_INTERVAL: Duration = Duration::from_secs(5);

/// Floor for the alert-monitor cadence.
const MIN_CHECK_INTERVAL: f64 = 5.0;

// ─── Worker probe ────────────────────────────────────────────────────────────

/// Health probe for the sandbox worker.  The concrete worker is an
/// external collaborator; the gateway only consumes this check.
pub trait WorkerProbe: Send + Sync {
    fn check_health(&self) -> bool;
}

/// Probe used when no sandbox worker is configured.
pub struct NoWorkerProbe;

impl WorkerProbe for NoWorkerProbe {
    fn check_health(&self) -> bool {
        true
    }
}

// ─── Runtime-mutable monitor state ───────────────────────────────────────────

/// Alert thresholds plus the sliding validation-error window and the last
/// observed worker health (for transition detection).
pub struct AlertState {
    settings: Mutex<AlertSettings>,
    validation_errors: Mutex<VecDeque<Instant>>,
    worker_was_healthy: Mutex<Option<bool>>,
}

impl AlertState {
    pub fn new(settings: AlertSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            validation_errors: Mutex::new(VecDeque::new()),
            worker_was_healthy: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> AlertSettings {
        self.settings.lock().clone()
    }

    pub fn update_settings(&self, settings: AlertSettings) {
        *self.settings.lock() = settings;
    }

    /// Record one schema-validation failure (feeds the rate alert).
    pub fn record_validation_error(&self) {
        self.validation_errors.lock().push_back(Instant::now());
    }

    /// Trim the deque to `window` and return the remaining count.
    pub fn validation_errors_within(&self, window: Duration) -> usize {
        let now = Instant::now();
        let mut times = self.validation_errors.lock();
        while times.front().is_some_and(|t| now.duration_since(*t) >= window) {
            times.pop_front();
        }
        times.len()
    }
}

/// Runtime-mutable approval timeout (seeds the reaper).
pub struct ApprovalConfigState {
    settings: Mutex<ApprovalSettings>,
}

impl ApprovalConfigState {
    pub fn new(settings: ApprovalSettings) -> Self {
        Self { settings: Mutex::new(settings) }
    }

    pub fn settings(&self) -> ApprovalSettings {
        self.settings.lock().clone()
    }

    pub fn update(&self, settings: ApprovalSettings) {
        *self.settings.lock() = settings;
    }
}

// ─── Approval reaper ─────────────────────────────────────────────────────────

/// One reaper pass: auto-reject stale pending approvals and emit the
/// audit entry plus both webhooks per expiry.
pub fn reaper_pass(
    supervisor: &Supervisor,
    webhooks: &Arc<WebhookDispatcher>,
    audit: &AuditLog,
    approvals: &ApprovalConfigState,
) {
    let timeout = approvals.settings().timeout_seconds;
    if timeout <= 0.0 {
        return;
    }
    let expired = supervisor
        .queue
        .expire_pending(Duration::from_secs_f64(timeout));
    for id in expired {
        audit.record("reject", Some("system"), json!({"id": id, "reason": "timeout"}));
        webhooks.fire("approval.rejected", json!({"approval_id": id, "reason": "timeout"}));
        webhooks.fire(
            "gateway.alert",
            json!({"alert": "approval_timeout", "approval_id": id}),
        );
        tracing::info!(approval_id = id, "approval auto-rejected after timeout");
    }
}

/// Spawn the reaper daemon (every 5 s).
pub fn spawn_approval_reaper(
    supervisor: Arc<Supervisor>,
    webhooks: Arc<WebhookDispatcher>,
    audit: Arc<AuditLog>,
    approvals: Arc<ApprovalConfigState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAPER_INTERVAL);
        loop {
            ticker.tick().await;
            reaper_pass(&supervisor, &webhooks, &audit, &approvals);
        }
    })
}

// ─── Alert monitor ───────────────────────────────────────────────────────────

/// One alert-monitor pass: worker health transitions + validation error
/// rate.
pub fn alert_monitor_pass(
    probe: &dyn WorkerProbe,
    webhooks: &Arc<WebhookDispatcher>,
    audit: &AuditLog,
    state: &AlertState,
) {
    let settings = state.settings();

    // Worker health transition alert.
    let healthy = probe.check_health();
    metrics::gauge!("worker_healthy").set(if healthy { 1.0 } else { 0.0 });
    {
        let mut was = state.worker_was_healthy.lock();
        if let Some(previous) = *was {
            if previous && !healthy {
                webhooks.fire("gateway.alert", json!({"alert": "worker_unhealthy"}));
                audit.record("alert_fired", Some("system"), json!({"alert": "worker_unhealthy"}));
            } else if !previous && healthy {
                webhooks.fire("gateway.alert", json!({"alert": "worker_recovered"}));
                audit.record("alert_fired", Some("system"), json!({"alert": "worker_recovered"}));
            }
        }
        *was = Some(healthy);
    }

    // Validation error rate alert.
    if settings.validation_error_threshold > 0 {
        let window = Duration::from_secs_f64(settings.validation_error_window_seconds);
        let count = state.validation_errors_within(window);
        if count >= settings.validation_error_threshold {
            webhooks.fire(
                "gateway.alert",
                json!({
                    "alert": "validation_error_rate",
                    "count": count,
                    "window_seconds": settings.validation_error_window_seconds,
                    "threshold": settings.validation_error_threshold,
                }),
            );
            audit.record(
                "alert_fired",
                Some("system"),
                json!({
                    "alert": "validation_error_rate",
                    "count": count,
                    "threshold": settings.validation_error_threshold,
                }),
            );
        }
    }
}

/// Spawn the alert monitor daemon.  The interval is re-read every pass so
/// config updates apply without a restart (floor 5 s).
pub fn spawn_alert_monitor(
    probe: Arc<dyn WorkerProbe>,
    webhooks: Arc<WebhookDispatcher>,
    audit: Arc<AuditLog>,
    state: Arc<AlertState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = state
                .settings()
                .worker_check_interval_seconds
                .max(MIN_CHECK_INTERVAL);
            tokio::time::sleep(Duration::from_secs_f64(interval)).await;
            alert_monitor_pass(probe.as_ref(), &webhooks, &audit, &state);
        }
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audit::AuditFilter,
        capability::{CapabilityVerifier, ManifestRegistry},
        config::WebhookSettings,
        filter::ContentFilter,
        supervisor::default_tool_schema,
    };
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct TogglingProbe(AtomicBool);

    impl WorkerProbe for TogglingProbe {
        fn check_health(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn fixture(dir: &TempDir) -> (Arc<Supervisor>, Arc<WebhookDispatcher>, Arc<AuditLog>) {
        let registry = Arc::new(ManifestRegistry::new(dir.path().join("manifests")));
        let verifier = Arc::new(CapabilityVerifier::from_allow_spec(registry, Some("ALL")));
        let filter = Arc::new(ContentFilter::new(dir.path().join("rules.json"), Vec::new()));
        let supervisor = Arc::new(
            Supervisor::new(default_tool_schema(), dir.path().join("schemas"), verifier, filter)
                .unwrap(),
        );
        let webhooks = Arc::new(WebhookDispatcher::new(
            dir.path().join("webhooks.json"),
            WebhookSettings::default(),
        ));
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.log"), None));
        (supervisor, webhooks, audit)
    }

    #[tokio::test]
    async fn reaper_rejects_stale_and_audits_as_system() {
        let dir = TempDir::new().unwrap();
        let (supervisor, webhooks, audit) = fixture(&dir);
        let approvals = ApprovalConfigState::new(ApprovalSettings { timeout_seconds: 1e-9 });

        let id = supervisor.queue.submit(
            json!({"tool": "system.exec", "args": {}}),
            crate::supervisor::risk::RiskLevel::High,
        );
        reaper_pass(&supervisor, &webhooks, &audit, &approvals);

        let status = supervisor.queue.status(id).unwrap();
        assert_eq!(status.status, crate::supervisor::approvals::ApprovalStatus::Rejected);
        let entries = audit.export(&AuditFilter::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "reject");
        assert_eq!(entries[0].actor.as_deref(), Some("system"));
        assert_eq!(entries[0].details["reason"], "timeout");
    }

    #[tokio::test]
    async fn reaper_disabled_when_timeout_is_zero() {
        let dir = TempDir::new().unwrap();
        let (supervisor, webhooks, audit) = fixture(&dir);
        let approvals = ApprovalConfigState::new(ApprovalSettings { timeout_seconds: 0.0 });
        supervisor.queue.submit(json!({}), crate::supervisor::risk::RiskLevel::High);
        reaper_pass(&supervisor, &webhooks, &audit, &approvals);
        assert_eq!(supervisor.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn worker_transitions_fire_on_edges_only() {
        let dir = TempDir::new().unwrap();
        let (_s, webhooks, audit) = fixture(&dir);
        let probe = TogglingProbe(AtomicBool::new(true));
        let state = AlertState::new(AlertSettings::default());

        // First pass establishes the baseline, no alert.
        alert_monitor_pass(&probe, &webhooks, &audit, &state);
        assert!(audit.export(&AuditFilter::default()).is_empty());

        // Healthy → unhealthy fires once.
        probe.0.store(false, Ordering::SeqCst);
        alert_monitor_pass(&probe, &webhooks, &audit, &state);
        alert_monitor_pass(&probe, &webhooks, &audit, &state);
        let entries = audit.export(&AuditFilter::default());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["alert"], "worker_unhealthy");

        // Unhealthy → healthy fires the recovery alert.
        probe.0.store(true, Ordering::SeqCst);
        alert_monitor_pass(&probe, &webhooks, &audit, &state);
        let entries = audit.export(&AuditFilter::default());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].details["alert"], "worker_recovered");
    }

    #[tokio::test]
    async fn validation_error_rate_alert_respects_threshold_and_window() {
        let dir = TempDir::new().unwrap();
        let (_s, webhooks, audit) = fixture(&dir);
        let state = AlertState::new(AlertSettings {
            validation_error_threshold: 3,
            validation_error_window_seconds: 60.0,
            ..AlertSettings::default()
        });

        state.record_validation_error();
        state.record_validation_error();
        alert_monitor_pass(&NoWorkerProbe, &webhooks, &audit, &state);
        let below: Vec<Value> = audit
            .export(&AuditFilter { event: Some("alert_fired".into()), ..Default::default() })
            .iter()
            .map(|e| e.details.clone())
            .collect();
        assert!(below.is_empty(), "below threshold must not alert");

        state.record_validation_error();
        alert_monitor_pass(&NoWorkerProbe, &webhooks, &audit, &state);
        let entries = audit.export(&AuditFilter { event: Some("alert_fired".into()), ..Default::default() });
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].details["alert"], "validation_error_rate");
        assert_eq!(entries[0].details["count"], 3);
    }

    #[test]
    fn validation_window_trims_old_entries() {
        let state = AlertState::new(AlertSettings::default());
        state.record_validation_error();
        assert_eq!(state.validation_errors_within(Duration::from_secs(60)), 1);
        assert_eq!(state.validation_errors_within(Duration::ZERO), 0);
    }
}
