//! Compliance audit trail for remediation activity
//!
//! Every consequential step in the engine — policy decision, execution,
//! approval, rollback — appends one entry here. The trail is a bounded
//! in-memory ring exposed read-only over the API; shipping it to durable
//! storage is a deployment concern, not a contract change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Entries retained before the oldest are dropped
const AUDIT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// Who acted: `policy_engine`, an approver name, `executor`
    pub actor: String,
    /// What happened: `policy_decision`, `execution`, `approval`, `rollback`
    pub action: String,
    /// What it happened to: action id, execution id, or request id
    pub resource: String,
    /// `allowed`, `denied`, `completed`, `failed`, `expired`, …
    pub outcome: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Bounded append-only audit ring
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        outcome: &str,
        details: Map<String, Value>,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            outcome: outcome.to_string(),
            details,
        };
        debug!(
            actor = %entry.actor,
            action = %entry.action,
            resource = %entry.resource,
            outcome = %entry.outcome,
            "Audit entry"
        );

        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == AUDIT_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Full trail, oldest first, optionally filtered by resource.
    pub fn trail(&self, resource: Option<&str>) -> Vec<AuditEntry> {
        let Ok(entries) = self.entries.lock() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|e| resource.map_or(true, |r| e.resource == r))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trail_filters_by_resource() {
        let log = AuditLog::new();
        log.record("policy_engine", "policy_decision", "qos_shaping", "allowed", Map::new());
        log.record("executor", "execution", "exec-1", "completed", Map::new());
        log.record("chief", "approval", "approval-1", "approved", Map::new());

        assert_eq!(log.trail(None).len(), 3);
        let execs = log.trail(Some("exec-1"));
        assert_eq!(execs.len(), 1);
        assert_eq!(execs[0].action, "execution");
    }

    #[test]
    fn ring_is_bounded() {
        let log = AuditLog::new();
        for i in 0..(AUDIT_CAPACITY + 10) {
            log.record("executor", "execution", &format!("exec-{i}"), "completed", Map::new());
        }
        assert_eq!(log.len(), AUDIT_CAPACITY);
        // Oldest entries were dropped
        assert!(log.trail(Some("exec-0")).is_empty());
    }
}
