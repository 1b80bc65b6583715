//! Approval queue state machine.
//!
//! Entries move `pending → {approved, rejected}` and never transition out
//! of a terminal state.  Ids are assigned monotonically and entries are
//! never deleted, so `GET /approvals/{id}` keeps answering after the
//! decision is made.

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::risk::RiskLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// One entry in the approval queue.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub id: u64,
    /// Sanitised call payload; secrets are already masked.
    pub payload: Value,
    pub status: ApprovalStatus,
    pub risk: RiskLevel,
    /// Wall-clock enqueue stamp for API consumers.
    pub enqueued_at: String,
    /// Monotonic stamp used for timeout computation.
    #[serde(skip)]
    enqueued: Instant,
}

#[derive(Default)]
struct QueueInner {
    store: BTreeMap<u64, ApprovalRequest>,
    next_id: u64,
}

/// Thread-safe approval queue.
pub struct ApprovalQueue {
    inner: Mutex<QueueInner>,
}

impl ApprovalQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner { store: BTreeMap::new(), next_id: 1 }),
        }
    }

    /// Enqueue a sanitised payload; returns the assigned id.
    pub fn submit(&self, payload: Value, risk: RiskLevel) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.store.insert(id, ApprovalRequest {
            id,
            payload,
            status: ApprovalStatus::Pending,
            risk,
            enqueued_at: Utc::now().to_rfc3339(),
            enqueued: Instant::now(),
        });
        id
    }

    /// Approve a pending request.  Returns `false` for unknown ids;
    /// idempotent on terminal states (the stored status is not changed).
    pub fn approve(&self, id: u64) -> bool {
        self.transition(id, ApprovalStatus::Approved)
    }

    /// Reject a pending request.  Same contract as [`approve`](Self::approve).
    pub fn reject(&self, id: u64) -> bool {
        self.transition(id, ApprovalStatus::Rejected)
    }

    fn transition(&self, id: u64, to: ApprovalStatus) -> bool {
        let mut inner = self.inner.lock();
        match inner.store.get_mut(&id) {
            Some(req) => {
                if req.status == ApprovalStatus::Pending {
                    req.status = to;
                }
                true
            }
            None => false,
        }
    }

    /// Single pass over pending entries: flip everything older than
    /// `timeout` to rejected and return the flipped ids.  Each id is
    /// returned at most once across calls.  A non-positive timeout
    /// disables expiry.
    pub fn expire_pending(&self, timeout: Duration) -> Vec<u64> {
        if timeout.is_zero() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut inner = self.inner.lock();
        for (id, req) in inner.store.iter_mut() {
            if req.status == ApprovalStatus::Pending
                && now.duration_since(req.enqueued) >= timeout
            {
                req.status = ApprovalStatus::Rejected;
                expired.push(*id);
            }
        }
        expired
    }

    pub fn status(&self, id: u64) -> Option<ApprovalRequest> {
        self.inner.lock().store.get(&id).cloned()
    }

    /// Snapshot of pending entries in id order.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        self.inner
            .lock()
            .store
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .lock()
            .store
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .count()
    }
}

impl Default for ApprovalQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ids_are_monotonic_from_one() {
        let q = ApprovalQueue::new();
        assert_eq!(q.submit(json!({}), RiskLevel::High), 1);
        assert_eq!(q.submit(json!({}), RiskLevel::High), 2);
        assert_eq!(q.submit(json!({}), RiskLevel::Low), 3);
    }

    #[test]
    fn approve_and_reject_transitions() {
        let q = ApprovalQueue::new();
        let a = q.submit(json!({"tool": "x"}), RiskLevel::High);
        let b = q.submit(json!({"tool": "y"}), RiskLevel::High);

        assert!(q.approve(a));
        assert!(q.reject(b));
        assert_eq!(q.status(a).unwrap().status, ApprovalStatus::Approved);
        assert_eq!(q.status(b).unwrap().status, ApprovalStatus::Rejected);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn unknown_ids_return_false() {
        let q = ApprovalQueue::new();
        assert!(!q.approve(42));
        assert!(!q.reject(42));
        assert!(q.status(42).is_none());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let q = ApprovalQueue::new();
        let id = q.submit(json!({}), RiskLevel::High);
        assert!(q.reject(id));
        // Approving after rejection is accepted (idempotent) but the
        // terminal state does not change.
        assert!(q.approve(id));
        assert_eq!(q.status(id).unwrap().status, ApprovalStatus::Rejected);
    }

    #[test]
    fn expire_pending_returns_each_id_once() {
        let q = ApprovalQueue::new();
        let id = q.submit(json!({}), RiskLevel::High);

        // Zero timeout disables expiry entirely.
        assert!(q.expire_pending(Duration::ZERO).is_empty());

        let expired = q.expire_pending(Duration::from_nanos(1));
        assert_eq!(expired, vec![id]);
        assert_eq!(q.status(id).unwrap().status, ApprovalStatus::Rejected);

        // A second pass finds nothing pending.
        assert!(q.expire_pending(Duration::from_nanos(1)).is_empty());
    }

    #[test]
    fn expire_pending_skips_fresh_entries() {
        let q = ApprovalQueue::new();
        q.submit(json!({}), RiskLevel::High);
        assert!(q.expire_pending(Duration::from_secs(3600)).is_empty());
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn list_pending_filters_terminal_entries() {
        let q = ApprovalQueue::new();
        let a = q.submit(json!({}), RiskLevel::High);
        let _b = q.submit(json!({}), RiskLevel::Medium);
        q.approve(a);
        let pending = q.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, 2);
    }
}
