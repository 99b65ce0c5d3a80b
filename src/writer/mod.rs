//! Incident Writer — persists correlated incidents with defensive recovery
//!
//! Consumes `incidents.created`, rebuilds every identity/metric field through
//! the cascading resolvers in [`recovery`], and inserts into the columnar
//! store. Inserts are idempotent on `incident_id`; updates (status,
//! acknowledgment, timeline appends) are serialized per incident id.

pub mod recovery;

use crate::bus::{decode_payload, topics, BusGateway, DedupCache};
use crate::config::defaults::HEALTH_CHECK_SECS;
use crate::health::HealthReporter;
use crate::incident_store::IncidentStoreClient;
use crate::registry::DeviceRegistryClient;
use crate::types::{
    new_tracking_id, Incident, IncidentStatus, TimelineEntry, SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Default)]
struct Counters {
    incidents_consumed: AtomicU64,
    incidents_stored: AtomicU64,
    store_errors: AtomicU64,
    parse_errors: AtomicU64,
    updates_applied: AtomicU64,
}

pub struct WriterService {
    bus: BusGateway,
    store: IncidentStoreClient,
    registry: Arc<DeviceRegistryClient>,
    dedup: DedupCache,
    /// Per-incident write serialization for the read-modify-write update path
    locks: DashMap<String, Arc<Mutex<()>>>,
    health: HealthReporter,
    counters: Counters,
}

impl WriterService {
    pub fn new(
        bus: BusGateway,
        store: IncidentStoreClient,
        registry: Arc<DeviceRegistryClient>,
        health: HealthReporter,
    ) -> Self {
        Self {
            bus,
            store,
            registry,
            dedup: DedupCache::default(),
            locks: DashMap::new(),
            health,
            counters: Counters::default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!("Incident writer started");
        let consumer = tokio::spawn(self.clone().consume_worker(cancel.clone()));
        let health = tokio::spawn(self.clone().health_loop(cancel));
        let _ = tokio::join!(consumer, health);
        info!("Incident writer stopped");
    }

    async fn consume_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) =
            crate::bus::subscribe_with_retry(&self.bus, topics::INCIDENTS_CREATED, &cancel)
                .await
        else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_incident(&message.payload).await;
                }
            }
        }
    }

    async fn handle_incident(&self, payload: &[u8]) {
        // Decode to a raw value first: defensive recovery has to see fields
        // that a typed decode would reject or drop.
        let raw = match decode_payload::<Value>(topics::INCIDENTS_CREATED, payload) {
            Ok(raw) => raw,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.counters.incidents_consumed.fetch_add(1, Ordering::Relaxed);

        let incident = self.rebuild(&raw).await;

        if !self
            .dedup
            .first_delivery(topics::INCIDENTS_CREATED, &incident.incident_id)
        {
            return;
        }

        let lock = self.lock_for(&incident.incident_id);
        let _guard = lock.lock().await;

        match self.store.insert(&incident).await {
            Ok(()) => {
                self.counters.incidents_stored.fetch_add(1, Ordering::Relaxed);
                info!(
                    incident_id = %incident.incident_id,
                    ship_id = %incident.ship_id,
                    service = %incident.service,
                    metric = %incident.metric_name,
                    severity = %incident.incident_severity,
                    "Incident persisted"
                );
            }
            Err(e) => {
                self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
                error!(incident_id = %incident.incident_id, error = %e, "Incident insert failed");
            }
        }
    }

    /// Rebuild a well-formed incident from whatever arrived, recording which
    /// source each recovered field came from.
    async fn rebuild(&self, raw: &Value) -> Incident {
        let (ship_id, ship_source) = recovery::resolve_ship_id(raw, &self.registry).await;
        let (service, service_source) = recovery::resolve_service(raw);
        let (metric_name, metric_name_source) = recovery::resolve_metric_name(raw);
        let (metric_value, metric_value_source) = recovery::resolve_metric_value(raw);
        let (anomaly_score, score_source) = recovery::resolve_anomaly_score(raw);
        let (incident_severity, severity_source) = recovery::resolve_severity(raw);

        let incident_id = raw
            .get("incident_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(
                || format!("inc-{}", uuid::Uuid::new_v4().simple()),
                String::from,
            );
        let tracking_id = raw
            .get("tracking_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map_or_else(new_tracking_id, String::from);

        let incident_type = raw
            .get("incident_type")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or("single_anomaly")
            .to_string();

        let status = raw
            .get("status")
            .and_then(Value::as_str)
            .and_then(IncidentStatus::parse)
            .unwrap_or_default();

        let mut metadata = raw
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut field_sources = Map::new();
        field_sources.insert("ship_id".to_string(), Value::from(ship_source));
        field_sources.insert("service".to_string(), Value::from(service_source));
        field_sources.insert("metric_name".to_string(), Value::from(metric_name_source));
        field_sources.insert("metric_value".to_string(), Value::from(metric_value_source));
        field_sources.insert("anomaly_score".to_string(), Value::from(score_source));
        field_sources.insert("incident_severity".to_string(), Value::from(severity_source));
        metadata.insert("field_sources".to_string(), Value::from(field_sources));

        info!(
            incident_id,
            ship_id,
            ship_source,
            service,
            metric_name,
            metric_value,
            "Incident fields recovered"
        );

        Incident {
            schema_version: SCHEMA_VERSION,
            incident_id,
            correlation_id: raw
                .get("correlation_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tracking_id,
            incident_type,
            incident_severity,
            ship_id,
            service,
            metric_name,
            metric_value,
            anomaly_score,
            detector: raw
                .get("detector")
                .or_else(|| raw.get("detector_name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status,
            acknowledged: raw
                .get("acknowledged")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            created_at: parse_timestamp(raw.get("created_at")),
            updated_at: parse_timestamp(raw.get("updated_at")),
            correlated_events: lenient_array(raw.get("correlated_events")),
            timeline: lenient_array(raw.get("timeline")),
            suggested_runbooks: raw
                .get("suggested_runbooks")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_else(|| vec!["generic_investigation".to_string()]),
            metadata,
            extra: Map::new(),
        }
    }

    /// Apply a status / acknowledgment / timeline update, serialized per
    /// incident id. Timeline entries only ever append.
    pub async fn apply_update(
        &self,
        incident_id: &str,
        status: Option<IncidentStatus>,
        acknowledged: Option<bool>,
        timeline_entry: Option<TimelineEntry>,
    ) -> crate::error::Result<Option<Incident>> {
        let lock = self.lock_for(incident_id);
        let _guard = lock.lock().await;

        let updated = self
            .store
            .update(incident_id, status, acknowledged, timeline_entry)
            .await?;
        if updated.is_some() {
            self.counters.updates_applied.fetch_add(1, Ordering::Relaxed);
        }
        Ok(updated)
    }

    fn lock_for(&self, incident_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(incident_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut deps = BTreeMap::new();
                    deps.insert("nats".to_string(), self.bus.is_connected());
                    deps.insert("clickhouse".to_string(), self.store.health_check().await);
                    let mut counters = BTreeMap::new();
                    counters.insert("incidents_consumed".to_string(), self.counters.incidents_consumed.load(Ordering::Relaxed));
                    counters.insert("incidents_stored".to_string(), self.counters.incidents_stored.load(Ordering::Relaxed));
                    counters.insert("store_errors".to_string(), self.counters.store_errors.load(Ordering::Relaxed));
                    counters.insert("parse_errors".to_string(), self.counters.parse_errors.load(Ordering::Relaxed));
                    counters.insert("updates_applied".to_string(), self.counters.updates_applied.load(Ordering::Relaxed));
                    self.health.report(deps, counters);
                    self.dedup.sweep();
                }
            }
        }
    }
}

fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map_or_else(Utc::now, |dt| dt.with_timezone(&Utc))
}

fn lenient_array<T: serde::de::DeserializeOwned>(value: Option<&Value>) -> Vec<T> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusGateway;
    use serde_json::json;

    async fn service() -> WriterService {
        crate::config::init_for_tests();
        let settings = crate::config::get();
        let ch = clickhouse::Client::default().with_url("http://127.0.0.1:1");
        WriterService::new(
            // Lazy connection; nothing in these tests awaits bus traffic.
            BusGateway::from_client(disconnected_client().await),
            IncidentStoreClient::new(ch),
            Arc::new(DeviceRegistryClient::new(
                "http://127.0.0.1:1",
                Duration::from_secs(settings.device_registry.cache_ttl_seconds),
                Duration::from_millis(50),
            )),
            crate::health::HealthRegistry::default().register("incident_writer"),
        )
    }

    #[allow(clippy::unwrap_used)]
    async fn disconnected_client() -> async_nats::Client {
        async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn rebuild_recovers_fields_and_tags_sources() {
        let writer = service().await;
        let raw = json!({
            "incident_id": "inc-T9",
            "tracking_id": "T9",
            "incident_severity": "info",
            "metadata": {"source_host": "gamma-radar-01"},
            "message": "Radar sweep latency at 93%",
            "detector_name": "log_pattern_detector",
            "created_at": "2026-03-01T12:00:00Z"
        });

        let incident = writer.rebuild(&raw).await;
        assert_eq!(incident.incident_id, "inc-T9");
        assert_eq!(incident.ship_id, "gamma-ship");
        assert_eq!(incident.incident_severity, crate::types::Severity::Low);
        assert_eq!(incident.metric_name, "log_anomaly");
        assert!((incident.metric_value - 93.0).abs() < f64::EPSILON);
        assert_eq!(incident.service, "log_service");
        assert_eq!(incident.status, IncidentStatus::Open);

        let sources = incident
            .metadata
            .get("field_sources")
            .and_then(Value::as_object)
            .unwrap();
        assert_eq!(
            sources.get("ship_id").and_then(Value::as_str),
            Some("hostname_derivation")
        );
        assert_eq!(
            sources.get("metric_value").and_then(Value::as_str),
            Some("message_percent")
        );
    }

    #[tokio::test]
    async fn rebuild_generates_ids_when_missing() {
        let writer = service().await;
        let incident = writer.rebuild(&json!({"message": "boom"})).await;
        assert!(incident.incident_id.starts_with("inc-"));
        assert!(!incident.tracking_id.is_empty());
        assert_eq!(incident.incident_type, "single_anomaly");
        assert_eq!(
            incident.suggested_runbooks,
            vec!["generic_investigation".to_string()]
        );
    }
}
