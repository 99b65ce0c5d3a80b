//! Correlator — many-to-one grouping of enriched events into incidents
//!
//! Events from `anomaly.detected.enriched.final` are grouped by
//! `(ship_id, service, signature)` where the signature is
//! `(metric_name, anomaly_type, severity bucket)`. Each key owns a tumbling
//! window (300 s default); the window closes when it elapses or when the
//! group has sat idle for 30 s, whichever comes first, and closing emits one
//! incident on `incidents.created`.
//!
//! Within a group, events are deduplicated by `tracking_id` and severity
//! only ever escalates. In-flight groups are process-local; durability comes
//! from bus redelivery plus the writer's idempotent insert.

use crate::bus::{decode_payload, topics, BusGateway, DedupCache};
use crate::config;
use crate::config::defaults::HEALTH_CHECK_SECS;
use crate::health::HealthReporter;
use crate::types::{
    CorrelatedEventSummary, EnrichedAnomalyEvent, Incident, IncidentStatus, Severity,
    TimelineEntry, SCHEMA_VERSION,
};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Signature → suggested runbooks. Unlisted signatures get the generic one.
fn suggest_runbooks(metric_name: &str, anomaly_type: &str) -> Vec<String> {
    let runbooks: &[&str] = match (metric_name, anomaly_type) {
        ("cpu_usage", _) => &["cpu_saturation_triage", "restart_noncritical_services"],
        ("memory_usage", _) => &["memory_pressure_triage"],
        ("disk_usage", _) => &["disk_cleanup", "log_rotation_check"],
        ("log_anomaly", _) => &["log_pattern_triage"],
        (m, _) if m.contains("satellite") => &["satellite_link_diagnostics"],
        (m, _) if m.contains("network") => &["network_path_diagnostics"],
        _ => &["generic_investigation"],
    };
    runbooks.iter().map(|r| (*r).to_string()).collect()
}

/// Grouping key: identity plus signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub ship_id: String,
    pub service: String,
    pub metric_name: String,
    pub anomaly_type: String,
    pub severity_bucket: Severity,
}

impl GroupKey {
    pub fn of(event: &EnrichedAnomalyEvent) -> Self {
        Self {
            ship_id: event.anomaly.ship_id.clone(),
            service: event.anomaly.service.clone(),
            metric_name: event.anomaly.metric_name.clone(),
            anomaly_type: event.anomaly.anomaly_type.clone(),
            severity_bucket: event.effective_risk(),
        }
    }
}

/// One in-flight incident group
struct OpenGroup {
    correlation_id: String,
    first_tracking_id: String,
    severity: Severity,
    /// Representative carries the incident's metric fields: the latest event
    /// holding the top risk level
    representative: EnrichedAnomalyEvent,
    summaries: Vec<CorrelatedEventSummary>,
    seen: HashSet<String>,
    opened_at: Instant,
    last_event_at: Instant,
}

impl OpenGroup {
    fn new(event: EnrichedAnomalyEvent, now: Instant) -> Self {
        let mut seen = HashSet::new();
        seen.insert(event.anomaly.tracking_id.clone());
        Self {
            correlation_id: format!("corr-{}", uuid::Uuid::new_v4().simple()),
            first_tracking_id: event.anomaly.tracking_id.clone(),
            severity: event.effective_risk(),
            summaries: vec![CorrelatedEventSummary::from(&event)],
            representative: event,
            seen,
            opened_at: now,
            last_event_at: now,
        }
    }

    /// Merge a later event. Returns false when the tracking id was already
    /// absorbed (redelivery).
    fn merge(&mut self, event: EnrichedAnomalyEvent, now: Instant) -> bool {
        if !self.seen.insert(event.anomaly.tracking_id.clone()) {
            return false;
        }
        let risk = event.effective_risk();
        // Monotonic escalation; ties broken by the latest event
        if risk >= self.severity {
            self.severity = risk;
            self.representative = event.clone();
        }
        self.summaries.push(CorrelatedEventSummary::from(&event));
        self.last_event_at = now;
        true
    }

    fn into_incident(self) -> Incident {
        let now = chrono::Utc::now();
        let anomaly = &self.representative.anomaly;

        let incident_type = if self.summaries.len() > 1 {
            "correlated_anomaly"
        } else {
            "single_anomaly"
        };

        let mut metadata = Map::new();
        metadata.insert(
            "group_size".to_string(),
            Value::from(self.summaries.len()),
        );
        metadata.insert(
            "operational_status".to_string(),
            Value::from(self.representative.maritime_context.operational_status.to_string()),
        );
        if let Some(host) = anomaly.meta.get("source_host") {
            metadata.insert("source_host".to_string(), host.clone());
        }
        // Load context travels with the incident for post-incident review
        if let Ok(load) = serde_json::to_value(&self.representative.enrichment_context.system_load)
        {
            metadata.insert("system_load".to_string(), load);
        }

        let mut timeline_seed = TimelineEntry::now(
            "incident_created",
            &format!(
                "Correlated {} event(s) for {}/{}",
                self.summaries.len(),
                anomaly.ship_id,
                anomaly.metric_name
            ),
            "correlator",
        );
        timeline_seed
            .metadata
            .insert("correlation_id".to_string(), Value::from(self.correlation_id.clone()));

        Incident {
            schema_version: SCHEMA_VERSION,
            // Deterministic so a replayed stream re-creates the same incident
            incident_id: format!("inc-{}", self.first_tracking_id),
            correlation_id: self.correlation_id,
            tracking_id: self.first_tracking_id,
            incident_type: incident_type.to_string(),
            incident_severity: self.severity,
            ship_id: anomaly.ship_id.clone(),
            service: anomaly.service.clone(),
            metric_name: anomaly.metric_name.clone(),
            metric_value: anomaly.metric_value,
            anomaly_score: self.representative.effective_score(),
            detector: anomaly.detector.clone(),
            status: IncidentStatus::Open,
            acknowledged: false,
            created_at: now,
            updated_at: now,
            correlated_events: self.summaries,
            timeline: vec![timeline_seed],
            suggested_runbooks: suggest_runbooks(&anomaly.metric_name, &anomaly.anomaly_type),
            metadata,
            extra: Map::new(),
        }
    }
}

/// In-flight groups keyed by signature; time is injected for testability.
pub struct GroupTable {
    groups: HashMap<GroupKey, OpenGroup>,
    window: Duration,
    idle_close: Duration,
}

impl GroupTable {
    pub fn new(window: Duration, idle_close: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            window,
            idle_close,
        }
    }

    pub fn from_settings(correlator: &config::CorrelatorSettings) -> Self {
        Self::new(
            Duration::from_secs(correlator.window_seconds),
            Duration::from_secs(correlator.idle_close_seconds),
        )
    }

    /// Route an event into its group. Returns true when the event was
    /// absorbed (false on intra-group redelivery).
    pub fn observe(&mut self, event: EnrichedAnomalyEvent, now: Instant) -> bool {
        let key = GroupKey::of(&event);
        match self.groups.get_mut(&key) {
            Some(group) => group.merge(event, now),
            None => {
                self.groups.insert(key, OpenGroup::new(event, now));
                true
            }
        }
    }

    /// Close every group whose window elapsed or that idled out, returning
    /// the incidents to emit.
    pub fn close_due(&mut self, now: Instant) -> Vec<Incident> {
        let window = self.window;
        let idle = self.idle_close;
        let due: Vec<GroupKey> = self
            .groups
            .iter()
            .filter(|(_, g)| {
                now.duration_since(g.opened_at) >= window
                    || now.duration_since(g.last_event_at) >= idle
            })
            .map(|(k, _)| k.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.groups.remove(&key))
            .map(OpenGroup::into_incident)
            .collect()
    }

    /// Close everything immediately (shutdown drain).
    pub fn close_all(&mut self) -> Vec<Incident> {
        self.groups
            .drain()
            .map(|(_, group)| group.into_incident())
            .collect()
    }

    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }
}

#[derive(Default)]
struct Counters {
    events_consumed: AtomicU64,
    incidents_emitted: AtomicU64,
    redeliveries: AtomicU64,
    parse_errors: AtomicU64,
    publish_errors: AtomicU64,
}

pub struct CorrelatorService {
    bus: BusGateway,
    table: Mutex<GroupTable>,
    dedup: DedupCache,
    health: HealthReporter,
    counters: Counters,
}

impl CorrelatorService {
    pub fn new(bus: BusGateway, health: HealthReporter) -> Self {
        Self {
            bus,
            table: Mutex::new(GroupTable::from_settings(&config::get().correlator)),
            dedup: DedupCache::default(),
            health,
            counters: Counters::default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            window_secs = config::get().correlator.window_seconds,
            idle_close_secs = config::get().correlator.idle_close_seconds,
            "Correlator started"
        );
        let consumer = tokio::spawn(self.clone().consume_worker(cancel.clone()));
        let sweeper = tokio::spawn(self.clone().window_sweeper(cancel.clone()));
        let health = tokio::spawn(self.clone().health_loop(cancel));
        let _ = tokio::join!(consumer, sweeper, health);

        // Drain whatever is still open so shutdown loses nothing.
        let remaining = self.table.lock().await.close_all();
        for incident in remaining {
            self.emit(incident).await;
        }
        info!("Correlator stopped");
    }

    async fn consume_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) =
            crate::bus::subscribe_with_retry(&self.bus, topics::ANOMALY_ENRICHED_FINAL, &cancel)
                .await
        else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_event(&message.payload).await;
                }
            }
        }
    }

    async fn handle_event(&self, payload: &[u8]) {
        let event =
            match decode_payload::<EnrichedAnomalyEvent>(topics::ANOMALY_ENRICHED_FINAL, payload) {
                Ok(event) => event,
                Err(_) => {
                    self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

        if !self
            .dedup
            .first_delivery(topics::ANOMALY_ENRICHED_FINAL, &event.anomaly.tracking_id)
        {
            self.counters.redeliveries.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.events_consumed.fetch_add(1, Ordering::Relaxed);

        let absorbed = self.table.lock().await.observe(event, Instant::now());
        if !absorbed {
            self.counters.redeliveries.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn window_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let due = self.table.lock().await.close_due(Instant::now());
                    for incident in due {
                        self.emit(incident).await;
                    }
                }
            }
        }
    }

    async fn emit(&self, incident: Incident) {
        match self.bus.publish_json(topics::INCIDENTS_CREATED, &incident).await {
            Ok(()) => {
                self.counters.incidents_emitted.fetch_add(1, Ordering::Relaxed);
                info!(
                    incident_id = %incident.incident_id,
                    severity = %incident.incident_severity,
                    events = incident.correlated_events.len(),
                    "Incident emitted"
                );
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    incident_id = %incident.incident_id,
                    error = %e,
                    "Incident publish dropped — upstream redelivery will retry"
                );
            }
        }
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut deps = std::collections::BTreeMap::new();
                    deps.insert("nats".to_string(), self.bus.is_connected());
                    let mut counters = std::collections::BTreeMap::new();
                    counters.insert("events_consumed".to_string(), self.counters.events_consumed.load(Ordering::Relaxed));
                    counters.insert("incidents_emitted".to_string(), self.counters.incidents_emitted.load(Ordering::Relaxed));
                    counters.insert("redeliveries".to_string(), self.counters.redeliveries.load(Ordering::Relaxed));
                    counters.insert("parse_errors".to_string(), self.counters.parse_errors.load(Ordering::Relaxed));
                    counters.insert("open_groups".to_string(), self.table.lock().await.open_groups() as u64);
                    self.health.report(deps, counters);
                    self.dedup.sweep();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnomalyEvent, CorrelationLevel, Domain, EnrichmentContext, MaritimeContext,
    };
    use std::collections::BTreeSet;

    fn enriched(tracking_id: &str, score: f64) -> EnrichedAnomalyEvent {
        EnrichedAnomalyEvent {
            anomaly: AnomalyEvent {
                schema_version: SCHEMA_VERSION,
                tracking_id: tracking_id.to_string(),
                timestamp: chrono::Utc::now(),
                ship_id: "alpha-ship".to_string(),
                device_id: "alpha-bridge-01".to_string(),
                service: "node_exporter".to_string(),
                domain: Domain::System,
                anomaly_type: "statistical_with_baseline".to_string(),
                metric_name: "cpu_usage".to_string(),
                metric_value: 95.0,
                threshold: 0.7,
                score,
                detector: "enhanced_detector".to_string(),
                raw_msg: None,
                meta: Map::new(),
                extra: Map::new(),
            },
            enrichment_context: EnrichmentContext::default(),
            maritime_context: MaritimeContext::default(),
            correlation_level: CorrelationLevel::Level2Enhanced,
            context_sources: BTreeSet::new(),
            enhanced_score: Some(score),
            risk_level: Some(Severity::from_score(score)),
            urgency: None,
            recommendations: Vec::new(),
            system_impact: None,
            grouping_analysis: None,
        }
    }

    #[test]
    fn same_signature_within_window_maps_to_one_incident() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));
        let start = Instant::now();

        assert!(table.observe(enriched("T1", 0.75), start));
        assert!(table.observe(enriched("T2", 0.75), start + Duration::from_secs(20)));
        assert!(table.observe(enriched("T3", 0.75), start + Duration::from_secs(40)));
        assert_eq!(table.open_groups(), 1);

        // Nothing due before the idle gap elapses
        assert!(table
            .close_due(start + Duration::from_secs(50))
            .is_empty());

        let incidents = table.close_due(start + Duration::from_secs(71));
        assert_eq!(incidents.len(), 1);
        let incident = &incidents[0];
        assert!(incident.correlated_events.len() >= 3);
        assert_eq!(incident.tracking_id, "T1");
        assert_eq!(incident.incident_id, "inc-T1");
        assert_eq!(incident.incident_type, "correlated_anomaly");
        assert!(!incident.correlation_id.is_empty());
        assert_eq!(incident.timeline.len(), 1);
        assert_eq!(incident.timeline[0].event, "incident_created");
    }

    #[test]
    fn duplicate_tracking_ids_are_absorbed_once() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));
        let start = Instant::now();

        assert!(table.observe(enriched("T1", 0.75), start));
        assert!(!table.observe(enriched("T1", 0.75), start + Duration::from_secs(1)));

        let incidents = table.close_due(start + Duration::from_secs(400));
        assert_eq!(incidents[0].correlated_events.len(), 1);
        assert_eq!(incidents[0].incident_type, "single_anomaly");
    }

    #[test]
    fn event_after_close_opens_new_correlation() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));
        let start = Instant::now();

        table.observe(enriched("T1", 0.75), start);
        let first = table.close_due(start + Duration::from_secs(31));
        assert_eq!(first.len(), 1);

        table.observe(enriched("T2", 0.75), start + Duration::from_secs(60));
        let second = table.close_due(start + Duration::from_secs(100));
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].correlation_id, second[0].correlation_id);
        assert_ne!(first[0].incident_id, second[0].incident_id);
    }

    #[test]
    fn severity_escalates_and_never_decreases() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(300));
        let start = Instant::now();

        // Same severity bucket is required for grouping, so escalate within
        // the bucket by raising risk through the enhanced score ladder edge.
        let mut low = enriched("T1", 0.75);
        low.risk_level = Some(Severity::High);
        let mut worse = enriched("T2", 0.79);
        worse.risk_level = Some(Severity::High);
        table.observe(low, start);
        table.observe(worse, start + Duration::from_secs(5));

        let incidents = table.close_due(start + Duration::from_secs(301));
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].incident_severity, Severity::High);
        // Tie on severity: representative is the latest event
        assert!((incidents[0].anomaly_score - 0.79).abs() < 1e-9);
    }

    #[test]
    fn window_elapse_closes_even_when_busy() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));
        let start = Instant::now();

        table.observe(enriched("T1", 0.75), start);
        // Keep the group busy so idle never triggers
        for i in 0..30 {
            table.observe(
                enriched(&format!("T{}", i + 2), 0.75),
                start + Duration::from_secs(10 * (u64::from(i as u32) + 1)),
            );
        }
        let incidents = table.close_due(start + Duration::from_secs(300));
        assert_eq!(incidents.len(), 1);
    }

    #[test]
    fn different_ships_never_share_an_incident() {
        let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));
        let start = Instant::now();

        table.observe(enriched("T1", 0.75), start);
        let mut other = enriched("T2", 0.75);
        other.anomaly.ship_id = "beta-ship".to_string();
        table.observe(other, start);

        assert_eq!(table.open_groups(), 2);
        let incidents = table.close_due(start + Duration::from_secs(400));
        assert_eq!(incidents.len(), 2);
    }

    #[test]
    fn runbooks_follow_signature() {
        assert!(suggest_runbooks("cpu_usage", "statistical_with_baseline")
            .contains(&"cpu_saturation_triage".to_string()));
        assert_eq!(
            suggest_runbooks("weird_metric", "statistical_with_baseline"),
            vec!["generic_investigation".to_string()]
        );
    }
}
