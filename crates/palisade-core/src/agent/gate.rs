//! In-loop approval gate.
//!
//! Distinct from the supervisor's pre-dispatch approval queue: this gate
//! holds a *running* tool loop while a human decides on one specific
//! invocation.  The engine registers the intent, surfaces an
//! `approval_required` event on the stream, and blocks on the decision
//! with a timeout; denial (or timeout) produces a synthetic `[DENIED]`
//! tool result and the loop continues.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;

/// Seconds a pending gate entry waits before auto-denial.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pending,
    Approved,
    Denied,
}

/// Public view of one gate entry.
#[derive(Debug, Clone, Serialize)]
pub struct GateEntryView {
    pub id: String,
    pub tool: String,
    pub args: Map<String, Value>,
    pub session_id: String,
    pub status: GateStatus,
}

struct GateEntry {
    tool: String,
    args: Map<String, Value>,
    session_id: String,
    decision: Mutex<Option<bool>>,
    notify: Notify,
}

pub struct ApprovalGate {
    entries: DashMap<String, Arc<GateEntry>>,
    timeout: Duration,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { entries: DashMap::new(), timeout }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.as_secs()
    }

    /// Register a pending intent; returns its gate id.
    pub fn register(&self, tool: &str, args: Map<String, Value>, session_id: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.entries.insert(
            id.clone(),
            Arc::new(GateEntry {
                tool: tool.to_owned(),
                args,
                session_id: session_id.to_owned(),
                decision: Mutex::new(None),
                notify: Notify::new(),
            }),
        );
        id
    }

    /// Block until the entry is decided or the timeout elapses.
    /// Timeout counts as denial.  The entry is removed afterwards.
    pub async fn wait_for_decision(&self, id: &str) -> bool {
        let Some(entry) = self.entries.get(id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let approved = tokio::time::timeout(self.timeout, async {
            loop {
                // Enroll as a waiter before reading the decision so a
                // `notify_waiters` landing between the read and the await
                // cannot be lost.
                let notified = entry.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(decision) = *entry.decision.lock() {
                    return decision;
                }
                notified.await;
            }
        })
        .await
        .unwrap_or(false);
        self.entries.remove(id);
        approved
    }

    pub fn approve(&self, id: &str) -> bool {
        self.decide(id, true)
    }

    pub fn deny(&self, id: &str) -> bool {
        self.decide(id, false)
    }

    fn decide(&self, id: &str, approved: bool) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        *entry.decision.lock() = Some(approved);
        entry.notify.notify_waiters();
        true
    }

    /// Pending entries, optionally restricted to one session.
    pub fn list_pending(&self, session_id: Option<&str>) -> Vec<GateEntryView> {
        self.entries
            .iter()
            .filter(|e| e.decision.lock().is_none())
            .filter(|e| session_id.is_none_or(|sid| e.session_id == sid))
            .map(|e| GateEntryView {
                id: e.key().clone(),
                tool: e.tool.clone(),
                args: e.args.clone(),
                session_id: e.session_id.clone(),
                status: GateStatus::Pending,
            })
            .collect()
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args() -> Map<String, Value> {
        json!({"cmd": "ls"}).as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn approval_unblocks_the_waiter() {
        let gate = Arc::new(ApprovalGate::new());
        let id = gate.register("shell_exec", args(), "sess-1");

        let waiter = {
            let gate = Arc::clone(&gate);
            let id = id.clone();
            tokio::spawn(async move { gate.wait_for_decision(&id).await })
        };
        tokio::task::yield_now().await;
        assert!(gate.approve(&id));
        assert!(waiter.await.unwrap());
        // Entry is consumed after the decision.
        assert!(gate.list_pending(None).is_empty());
    }

    #[tokio::test]
    async fn denial_unblocks_with_false() {
        let gate = Arc::new(ApprovalGate::new());
        let id = gate.register("file_delete", args(), "sess-1");
        let waiter = {
            let gate = Arc::clone(&gate);
            let id = id.clone();
            tokio::spawn(async move { gate.wait_for_decision(&id).await })
        };
        tokio::task::yield_now().await;
        assert!(gate.deny(&id));
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn timeout_counts_as_denial() {
        let gate = ApprovalGate::with_timeout(Duration::from_millis(20));
        let id = gate.register("shell_exec", args(), "s");
        assert!(!gate.wait_for_decision(&id).await);
    }

    #[tokio::test]
    async fn decisions_on_unknown_ids_fail() {
        let gate = ApprovalGate::new();
        assert!(!gate.approve("nope"));
        assert!(!gate.deny("nope"));
        assert!(!gate.wait_for_decision("nope").await);
    }

    #[tokio::test]
    async fn pending_list_filters_by_session() {
        let gate = ApprovalGate::new();
        gate.register("a", args(), "s1");
        gate.register("b", args(), "s2");
        assert_eq!(gate.list_pending(None).len(), 2);
        let s1 = gate.list_pending(Some("s1"));
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].tool, "a");
    }

    #[tokio::test]
    async fn decision_before_wait_resolves_immediately() {
        let gate = ApprovalGate::new();
        let id = gate.register("shell_exec", args(), "s");
        gate.approve(&id);
        assert!(gate.wait_for_decision(&id).await);
    }

    #[tokio::test]
    async fn decision_racing_with_wait_is_never_lost() {
        // No yield between spawning the waiter and deciding, so the
        // decision can land in the gap between the waiter's decision
        // check and its await.  The short gate timeout turns a lost
        // wakeup into a fast `false` instead of a hang.
        let gate = Arc::new(ApprovalGate::with_timeout(Duration::from_millis(200)));
        for _ in 0..100 {
            let id = gate.register("shell_exec", args(), "s");
            let waiter = {
                let gate = Arc::clone(&gate);
                let id = id.clone();
                tokio::spawn(async move { gate.wait_for_decision(&id).await })
            };
            assert!(gate.approve(&id));
            assert!(waiter.await.unwrap(), "approved decision was lost");
        }
    }
}
