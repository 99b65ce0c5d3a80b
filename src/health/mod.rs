//! Component health — per-fiber status values surfaced over HTTP
//!
//! Each pipeline component owns a [`HealthReporter`] and publishes immutable
//! snapshots through a `watch` channel; the API layer holds the receivers and
//! assembles `/health` responses read-only. No shared mutable health map.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Point-in-time health snapshot for one component
#[derive(Debug, Clone, Serialize)]
pub struct ComponentReport {
    pub component: String,
    pub healthy: bool,
    /// Per-dependency connectivity, e.g. `{"nats": true, "clickhouse": false}`
    pub dependencies: BTreeMap<String, bool>,
    /// Monotonic counters (events processed, errors, …)
    pub counters: BTreeMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

impl ComponentReport {
    fn initial(component: &str) -> Self {
        Self {
            component: component.to_string(),
            healthy: false,
            dependencies: BTreeMap::new(),
            counters: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Writer half held by a component's supervisor
#[derive(Clone)]
pub struct HealthReporter {
    tx: watch::Sender<ComponentReport>,
    component: String,
}

impl HealthReporter {
    /// Publish a fresh snapshot. A component is healthy when every
    /// dependency it declares is reachable.
    pub fn report(&self, dependencies: BTreeMap<String, bool>, counters: BTreeMap<String, u64>) {
        let healthy = dependencies.values().all(|&up| up);
        let report = ComponentReport {
            component: self.component.clone(),
            healthy,
            dependencies,
            counters,
            updated_at: Utc::now(),
        };
        // Receivers may be gone during shutdown; nothing to do about it.
        let _ = self.tx.send(report);
    }
}

/// Read-only registry of all component health channels
#[derive(Clone, Default)]
pub struct HealthRegistry {
    receivers: Vec<watch::Receiver<ComponentReport>>,
}

impl HealthRegistry {
    /// Register a component, returning its reporter half.
    pub fn register(&mut self, component: &str) -> HealthReporter {
        let (tx, rx) = watch::channel(ComponentReport::initial(component));
        self.receivers.push(rx);
        HealthReporter {
            tx,
            component: component.to_string(),
        }
    }

    /// Snapshot every component's latest report.
    pub fn snapshot(&self) -> Vec<ComponentReport> {
        self.receivers.iter().map(|rx| rx.borrow().clone()).collect()
    }

    /// The process is healthy when every component is.
    pub fn overall_healthy(&self) -> bool {
        let reports = self.snapshot();
        !reports.is_empty() && reports.iter().all(|r| r.healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reflects_component_reports() {
        let mut registry = HealthRegistry::default();
        let detector = registry.register("detector");
        let writer = registry.register("incident_writer");

        assert!(!registry.overall_healthy());

        let mut deps = BTreeMap::new();
        deps.insert("nats".to_string(), true);
        detector.report(deps.clone(), BTreeMap::new());
        writer.report(deps, BTreeMap::new());
        assert!(registry.overall_healthy());

        let mut down = BTreeMap::new();
        down.insert("clickhouse".to_string(), false);
        writer.report(down, BTreeMap::new());
        assert!(!registry.overall_healthy());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|r| r.component == "detector" && r.healthy));
    }
}
