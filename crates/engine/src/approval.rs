//! Pending tool approvals.
//!
//! A tool gated on approval does not execute at dispatch time; the run
//! parks the request here, emits an approval event, and keeps going. The
//! caller resolves it through `AgentRun::approve`, and the periodic tick
//! turns expired entries into synthetic timeout responses so the turn never
//! blocks forever.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tiller_domain::ToolCall;

/// A tool call waiting for a human decision.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: String,
    pub call: ToolCall,
    pub args: serde_json::Value,
    pub group_id: u64,
    pub requested_at: Instant,
}

/// Approvals owned by a single run worker; no locking needed.
#[derive(Debug)]
pub struct ApprovalQueue {
    pending: HashMap<String, PendingApproval>,
    timeout: Duration,
}

impl ApprovalQueue {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    pub fn insert(&mut self, approval: PendingApproval) {
        self.pending.insert(approval.approval_id.clone(), approval);
    }

    /// Remove and return a pending approval, however it resolves.
    pub fn resolve(&mut self, approval_id: &str) -> Option<PendingApproval> {
        self.pending.remove(approval_id)
    }

    /// Drain every approval whose deadline has passed.
    pub fn expired(&mut self, now: Instant) -> Vec<PendingApproval> {
        let timeout = self.timeout;
        let expired_ids: Vec<String> = self
            .pending
            .values()
            .filter(|p| now.duration_since(p.requested_at) >= timeout)
            .map(|p| p.approval_id.clone())
            .collect();
        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(id: &str) -> PendingApproval {
        PendingApproval {
            approval_id: id.into(),
            call: ToolCall {
                id: format!("tc_{id}"),
                name: "dangerous".into(),
                arguments: "{}".into(),
            },
            args: serde_json::json!({}),
            group_id: 1,
            requested_at: Instant::now(),
        }
    }

    #[test]
    fn resolve_removes_the_entry() {
        let mut queue = ApprovalQueue::new(Duration::from_secs(60));
        queue.insert(pending("a"));
        assert!(queue.resolve("a").is_some());
        assert!(queue.resolve("a").is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn expired_drains_only_past_deadline() {
        let mut queue = ApprovalQueue::new(Duration::from_millis(10));
        let mut old = pending("old");
        old.requested_at = Instant::now() - Duration::from_millis(50);
        queue.insert(old);
        queue.insert(pending("fresh"));

        let expired = queue.expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].approval_id, "old");
        assert!(!queue.is_empty());
    }
}
