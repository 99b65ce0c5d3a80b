//! Anomaly Detector — dual-input first stage of the pipeline
//!
//! Two fibers feed `anomaly.detected`:
//! - a pull loop that queries the metrics store every cycle and runs the
//!   statistical detector bank plus a historical-baseline comparison
//! - a push subscriber on `logs.anomalous` that filters and scores raw log
//!   records from the log router
//!
//! Failure semantics: metric-store errors log and skip the cycle; publish
//! errors log and drop (the bus redelivers upstream); a detector misbehaving
//! on one metric never stops the others.

pub mod log_filter;
pub mod statistical;

use crate::bus::{decode_payload, topics, BusGateway, DedupCache};
use crate::config;
use crate::config::defaults::HEALTH_CHECK_SECS;
use crate::health::HealthReporter;
use crate::metrics_store::{InstantSample, MetricsStoreClient};
use crate::registry::DeviceRegistryClient;
use crate::types::{
    new_tracking_id, AnomalyEvent, Domain, OperationalSnapshot, SCHEMA_VERSION,
};
use futures::StreamExt;
use serde_json::{Map, Value};
use statistical::{contextual_threshold, DetectorBank};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    cycle_errors: AtomicU64,
    logs_processed: AtomicU64,
    logs_skipped: AtomicU64,
    parse_errors: AtomicU64,
    anomalies_published: AtomicU64,
    publish_errors: AtomicU64,
}

/// Supervisor state for the detector component
pub struct DetectorService {
    bus: BusGateway,
    metrics: Arc<MetricsStoreClient>,
    registry: Arc<DeviceRegistryClient>,
    bank: Mutex<DetectorBank>,
    dedup: DedupCache,
    ops: watch::Receiver<OperationalSnapshot>,
    health: HealthReporter,
    counters: Counters,
}

impl DetectorService {
    pub fn new(
        bus: BusGateway,
        metrics: Arc<MetricsStoreClient>,
        registry: Arc<DeviceRegistryClient>,
        ops: watch::Receiver<OperationalSnapshot>,
        health: HealthReporter,
    ) -> Self {
        Self {
            bus,
            metrics,
            registry,
            bank: Mutex::new(DetectorBank::from_settings(&config::get().detection)),
            dedup: DedupCache::default(),
            ops,
            health,
            counters: Counters::default(),
        }
    }

    /// Run all detector fibers until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            cycle_secs = config::get().detection.cycle_seconds,
            queries = config::get().detection.queries.len(),
            "Anomaly detector started"
        );
        let pull = tokio::spawn(self.clone().pull_loop(cancel.clone()));
        let logs = tokio::spawn(self.clone().log_worker(cancel.clone()));
        let health = tokio::spawn(self.clone().health_loop(cancel));
        let _ = tokio::join!(pull, logs, health);
        info!("Anomaly detector stopped");
    }

    // ------------------------------------------------------------------
    // Pull loop
    // ------------------------------------------------------------------

    async fn pull_loop(self: Arc<Self>, cancel: CancellationToken) {
        let cycle = Duration::from_secs(config::get().detection.cycle_seconds);
        let mut interval = tokio::time::interval(cycle);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.counters.cycles.fetch_add(1, Ordering::Relaxed);
                    self.process_metrics().await;
                }
            }
        }
    }

    async fn process_metrics(&self) {
        let snapshot = self.ops.borrow().clone();

        for query in &config::get().detection.queries {
            if !query.enabled {
                continue;
            }

            let samples = match self.metrics.instant(&query.query).await {
                Ok(samples) => samples,
                Err(e) => {
                    self.counters.cycle_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(metric = %query.name, error = %e, "Metrics query failed — skipping cycle");
                    continue;
                }
            };

            for sample in samples {
                if let Err(e) = self.evaluate_sample(query, &sample, &snapshot).await {
                    self.counters.cycle_errors.fetch_add(1, Ordering::Relaxed);
                    error!(metric = %query.name, error = %e, "Sample evaluation failed");
                }
            }
        }
    }

    async fn evaluate_sample(
        &self,
        query: &config::MetricQuery,
        sample: &InstantSample,
        snapshot: &OperationalSnapshot,
    ) -> crate::error::Result<()> {
        let ship_id = label_or(&sample.labels, &["ship_id", "instance"], "unknown-ship");
        let device_id = label_or(&sample.labels, &["device_id", "instance"], "unknown-device");
        let service = label_or(&sample.labels, &["job"], "unknown");

        let scores = {
            let mut bank = self.bank.lock().await;
            bank.update_and_detect(&query.name, sample.value)
        };
        let max_statistical = scores.values().copied().fold(0.0_f64, f64::max);

        let baseline = self.metrics.baseline(&ship_id, &query.name, 7).await;
        let historical_score = baseline.deviation_score(sample.value);
        let combined = max_statistical.max(historical_score);

        // Base threshold: the per-metric table entry when present, else the
        // query's own threshold; then modulated by operational context.
        // Table entries above 1.0 are native-unit thresholds (dB, ms) for
        // the contextual rules, not score thresholds — skip those here.
        let thresholds = &config::get().thresholds;
        let base_threshold = thresholds
            .base
            .get(&query.name)
            .copied()
            .filter(|t| *t <= 1.0)
            .unwrap_or(query.threshold);
        let effective_threshold =
            contextual_threshold(base_threshold, &query.name, snapshot.status, &snapshot.weather);

        if combined <= effective_threshold {
            return Ok(());
        }

        let patterns = self.metrics.correlation_patterns(&query.name, 100).await;
        let resolutions = self.metrics.resolution_history(&query.name, 50).await;

        let mut meta = Map::new();
        meta.insert("query".to_string(), Value::from(query.query.clone()));
        meta.insert("vm_timestamp".to_string(), Value::from(sample.timestamp));
        meta.insert(
            "statistical_scores".to_string(),
            Value::from(
                scores
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), Value::from(*v)))
                    .collect::<Map<String, Value>>(),
            ),
        );
        meta.insert(
            "historical_baselines".to_string(),
            serde_json::to_value(baseline).unwrap_or(Value::Null),
        );
        meta.insert(
            "historical_anomaly_score".to_string(),
            Value::from(historical_score),
        );
        meta.insert("combined_score".to_string(), Value::from(combined));
        meta.insert(
            "correlation_patterns_count".to_string(),
            Value::from(patterns.len()),
        );
        meta.insert(
            "resolution_history_count".to_string(),
            Value::from(resolutions.len()),
        );
        meta.insert(
            "similar_incidents".to_string(),
            serde_json::to_value(resolutions.iter().take(3).collect::<Vec<_>>())
                .unwrap_or(Value::Null),
        );

        let event = AnomalyEvent {
            schema_version: SCHEMA_VERSION,
            tracking_id: new_tracking_id(),
            timestamp: chrono::Utc::now(),
            ship_id,
            device_id,
            service,
            domain: Domain::classify(&query.name),
            anomaly_type: "statistical_with_baseline".to_string(),
            metric_name: query.name.clone(),
            metric_value: sample.value,
            threshold: effective_threshold,
            score: combined,
            detector: "enhanced_detector".to_string(),
            raw_msg: None,
            meta,
            extra: Map::new(),
        };

        self.publish(event).await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Log path
    // ------------------------------------------------------------------

    async fn log_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) =
            crate::bus::subscribe_with_retry(&self.bus, topics::LOGS_ANOMALOUS, &cancel).await
        else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_log(&message.payload).await;
                }
            }
        }
    }

    async fn handle_log(&self, payload: &[u8]) {
        let record = match decode_payload::<crate::types::LogRecord>(topics::LOGS_ANOMALOUS, payload)
        {
            Ok(record) => record,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.counters.logs_processed.fetch_add(1, Ordering::Relaxed);

        // Redelivered records with a tracking id are handled once.
        if let Some(ref tracking_id) = record.tracking_id {
            if !self.dedup.first_delivery(topics::LOGS_ANOMALOUS, tracking_id) {
                return;
            }
        }

        if let Some(reason) = log_filter::filter(&record) {
            self.counters.logs_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(?reason, preview = %preview(&record.message), "Log record filtered");
            return;
        }

        let event = log_filter::build_event(&record, &self.registry).await;
        // Residual-grade records (NOTICE etc.) score below the log threshold;
        // published events always satisfy score >= threshold.
        if event.score < event.threshold {
            self.counters.logs_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(
                tracking_id = %event.tracking_id,
                score = event.score,
                "Log record below anomaly threshold"
            );
            return;
        }
        info!(
            tracking_id = %event.tracking_id,
            ship_id = %event.ship_id,
            score = event.score,
            "Log anomaly scored"
        );
        self.publish(event).await;
    }

    async fn publish(&self, event: AnomalyEvent) {
        match self.bus.publish_json(topics::ANOMALY_DETECTED, &event).await {
            Ok(()) => {
                self.counters.anomalies_published.fetch_add(1, Ordering::Relaxed);
                info!(
                    tracking_id = %event.tracking_id,
                    metric = %event.metric_name,
                    score = format!("{:.3}", event.score),
                    "Anomaly published"
                );
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, tracking_id = %event.tracking_id, "Anomaly publish dropped");
            }
        }
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut deps = BTreeMap::new();
                    deps.insert("nats".to_string(), self.bus.is_connected());
                    deps.insert("metrics_store".to_string(), self.metrics.health_check().await);
                    deps.insert("device_registry".to_string(), self.registry.health_check().await);
                    self.health.report(deps, self.counter_snapshot());
                    self.dedup.sweep();
                }
            }
        }
    }

    fn counter_snapshot(&self) -> BTreeMap<String, u64> {
        let mut counters = BTreeMap::new();
        counters.insert(
            "cycles".to_string(),
            self.counters.cycles.load(Ordering::Relaxed),
        );
        counters.insert(
            "cycle_errors".to_string(),
            self.counters.cycle_errors.load(Ordering::Relaxed),
        );
        counters.insert(
            "logs_processed".to_string(),
            self.counters.logs_processed.load(Ordering::Relaxed),
        );
        counters.insert(
            "logs_skipped".to_string(),
            self.counters.logs_skipped.load(Ordering::Relaxed),
        );
        counters.insert(
            "parse_errors".to_string(),
            self.counters.parse_errors.load(Ordering::Relaxed),
        );
        counters.insert(
            "anomalies_published".to_string(),
            self.counters.anomalies_published.load(Ordering::Relaxed),
        );
        counters.insert(
            "publish_errors".to_string(),
            self.counters.publish_errors.load(Ordering::Relaxed),
        );
        counters
    }
}

fn label_or(labels: &BTreeMap<String, String>, keys: &[&str], fallback: &str) -> String {
    for key in keys {
        if let Some(value) = labels.get(*key).filter(|v| !v.is_empty()) {
            return value.clone();
        }
    }
    fallback.to_string()
}

fn preview(message: &str) -> String {
    message.chars().take(50).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_fallback_order() {
        let mut labels = BTreeMap::new();
        labels.insert("instance".to_string(), "alpha-bridge-01".to_string());
        assert_eq!(label_or(&labels, &["ship_id", "instance"], "unknown-ship"), "alpha-bridge-01");
        labels.insert("ship_id".to_string(), "alpha-ship".to_string());
        assert_eq!(label_or(&labels, &["ship_id", "instance"], "unknown-ship"), "alpha-ship");
        assert_eq!(label_or(&BTreeMap::new(), &["job"], "unknown"), "unknown");
    }
}
