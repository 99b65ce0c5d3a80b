//! Enricher — two-stage contextual enrichment
//!
//! Stage 1 (`anomaly.detected` → `anomaly.detected.enriched`) attaches
//! device identity, weather, host load, and the derived operational status.
//! Stage 2 (`anomaly.detected.enriched` → `anomaly.detected.enriched.final`)
//! runs the enhancement analysis (external endpoint or rule-based fallback)
//! and the grouping analysis, then stamps `level_2_enhanced`.
//!
//! The enricher is stateless except for bounded TTL caches (registry,
//! weather) and a per-ship load snapshot. Each processed event also feeds
//! the operational snapshot back to the detector's threshold adjustment.

pub mod enhancement;
pub mod weather;

use crate::bus::{decode_payload, subscribe_with_retry, topics, BusGateway, DedupCache};
use crate::config::defaults::HEALTH_CHECK_SECS;
use crate::health::HealthReporter;
use crate::metrics_store::MetricsStoreClient;
use crate::registry::DeviceRegistryClient;
use crate::types::{
    AnomalyEvent, CorrelationLevel, EnrichedAnomalyEvent, EnrichmentContext, GroupingAnalysis,
    HistoricalPatterns, MaritimeContext, OperationalSnapshot, OperationalStatus,
    SourceCorrelation, SystemLoad, WeatherImpact,
};
use dashmap::DashMap;
use enhancement::EnhancementClient;
use futures::StreamExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use weather::WeatherProvider;

#[derive(Default)]
struct Counters {
    stage1_processed: AtomicU64,
    stage2_processed: AtomicU64,
    published: AtomicU64,
    parse_errors: AtomicU64,
    publish_errors: AtomicU64,
}

pub struct EnricherService {
    bus: BusGateway,
    registry: Arc<DeviceRegistryClient>,
    metrics: Arc<MetricsStoreClient>,
    weather: WeatherProvider,
    enhancement: EnhancementClient,
    /// Last-seen load per ship, fed by the events themselves
    load: DashMap<String, SystemLoad>,
    dedup: DedupCache,
    ops_tx: watch::Sender<OperationalSnapshot>,
    health: HealthReporter,
    counters: Counters,
}

impl EnricherService {
    pub fn new(
        bus: BusGateway,
        registry: Arc<DeviceRegistryClient>,
        metrics: Arc<MetricsStoreClient>,
        ops_tx: watch::Sender<OperationalSnapshot>,
        health: HealthReporter,
    ) -> Self {
        let endpoints = &crate::config::get().endpoints;
        Self {
            bus,
            registry,
            metrics,
            weather: WeatherProvider::new(&endpoints.weather_url),
            enhancement: EnhancementClient::new(
                &endpoints.enhancement_url,
                &endpoints.enhancement_model,
            ),
            load: DashMap::new(),
            dedup: DedupCache::default(),
            ops_tx,
            health,
            counters: Counters::default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            weather = self.weather.is_configured(),
            enhancement = self.enhancement.is_configured(),
            "Enricher started"
        );
        let stage1 = tokio::spawn(self.clone().stage1_worker(cancel.clone()));
        let stage2 = tokio::spawn(self.clone().stage2_worker(cancel.clone()));
        let health = tokio::spawn(self.clone().health_loop(cancel));
        let _ = tokio::join!(stage1, stage2, health);
        info!("Enricher stopped");
    }

    // ------------------------------------------------------------------
    // Stage 1
    // ------------------------------------------------------------------

    async fn stage1_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) = subscribe_with_retry(&self.bus, topics::ANOMALY_DETECTED, &cancel).await
        else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_stage1(&message.payload).await;
                }
            }
        }
    }

    async fn handle_stage1(&self, payload: &[u8]) {
        let event = match decode_payload::<AnomalyEvent>(topics::ANOMALY_DETECTED, payload) {
            Ok(event) => event,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self.dedup.first_delivery(topics::ANOMALY_DETECTED, &event.tracking_id) {
            return;
        }
        self.counters.stage1_processed.fetch_add(1, Ordering::Relaxed);

        let enriched = self.enrich_level1(event).await;
        self.publish(topics::ANOMALY_ENRICHED, &enriched).await;
    }

    /// Attach device, weather, and load context; derive operational status.
    async fn enrich_level1(&self, event: AnomalyEvent) -> EnrichedAnomalyEvent {
        let mut context_sources = std::collections::BTreeSet::new();

        // Device context: prefer the log record's source host, else device id
        let lookup_host = event
            .meta
            .get("source_host")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .unwrap_or(&event.device_id)
            .to_string();

        let mut device_context = Map::new();
        if let Some(mapping) = self.registry.lookup(&lookup_host).await {
            device_context.insert("ship_id".to_string(), Value::from(mapping.ship_id));
            device_context.insert("device_id".to_string(), Value::from(mapping.device_id));
            device_context.insert("device_type".to_string(), Value::from(mapping.device_type));
            device_context.insert("location".to_string(), Value::from(mapping.location));
            context_sources.insert("device_registry".to_string());
        } else {
            device_context.insert("resolution".to_string(), Value::from("fallback"));
            context_sources.insert("fallback_identity".to_string());
        }

        let weather = self.weather.current(&event.ship_id).await;
        if weather.source == "weather_api" {
            context_sources.insert("weather_api".to_string());
        }

        let load = self.update_load(&event);
        context_sources.insert("system_metrics".to_string());

        let status = derive_operational_status(&weather, &load);
        // Feedback to the detector's contextual thresholds
        let _ = self.ops_tx.send(OperationalSnapshot {
            status,
            weather: weather.clone(),
        });

        EnrichedAnomalyEvent {
            anomaly: event,
            enrichment_context: EnrichmentContext {
                device_context,
                weather_impact: weather,
                system_load: load,
                ai_analysis: None,
            },
            maritime_context: MaritimeContext {
                operational_status: status,
                route: None,
                location: None,
            },
            correlation_level: CorrelationLevel::Level1Enriched,
            context_sources,
            enhanced_score: None,
            risk_level: None,
            urgency: None,
            recommendations: Vec::new(),
            system_impact: None,
            grouping_analysis: None,
        }
    }

    /// Record the metric carried by this event into the per-ship load
    /// snapshot and return the current view.
    fn update_load(&self, event: &AnomalyEvent) -> SystemLoad {
        let mut entry = self.load.entry(event.ship_id.clone()).or_default();
        match event.metric_name.as_str() {
            "cpu_usage" => entry.cpu_pct = event.metric_value,
            "memory_usage" => entry.memory_pct = event.metric_value,
            "network_packet_loss" => entry.recent_packet_loss_pct = event.metric_value,
            "network_latency" => entry.recent_latency_ms = event.metric_value,
            _ => {}
        }
        entry.clone()
    }

    // ------------------------------------------------------------------
    // Stage 2
    // ------------------------------------------------------------------

    async fn stage2_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) = subscribe_with_retry(&self.bus, topics::ANOMALY_ENRICHED, &cancel).await
        else {
            return;
        };

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_stage2(&message.payload).await;
                }
            }
        }
    }

    async fn handle_stage2(&self, payload: &[u8]) {
        let event = match decode_payload::<EnrichedAnomalyEvent>(topics::ANOMALY_ENRICHED, payload)
        {
            Ok(event) => event,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self
            .dedup
            .first_delivery(topics::ANOMALY_ENRICHED, &event.anomaly.tracking_id)
        {
            return;
        }
        self.counters.stage2_processed.fetch_add(1, Ordering::Relaxed);

        let enhanced = self.enrich_level2(event).await;
        self.publish(topics::ANOMALY_ENRICHED_FINAL, &enhanced).await;
    }

    async fn enrich_level2(&self, mut event: EnrichedAnomalyEvent) -> EnrichedAnomalyEvent {
        let analysis = self.enhancement.analyze(&event).await;
        let grouping = self.grouping_analysis(&event).await;

        event.enrichment_context.ai_analysis = serde_json::to_value(&analysis).ok();
        event.enhanced_score = Some(analysis.enhanced_score);
        event.risk_level = Some(analysis.risk_level);
        event.urgency = Some(analysis.urgency);
        event.recommendations = analysis.recommendations;
        event.system_impact = Some(analysis.system_impact);
        event.grouping_analysis = Some(grouping);
        event.correlation_level = CorrelationLevel::Level2Enhanced;
        event
            .context_sources
            .insert(analysis.analysis_method.clone());
        event
    }

    /// Temporal/source/history block from the columnar pattern query.
    async fn grouping_analysis(&self, event: &EnrichedAnomalyEvent) -> GroupingAnalysis {
        let patterns = self
            .metrics
            .correlation_patterns(&event.anomaly.metric_name, 100)
            .await;

        let cutoff = chrono::Utc::now() - chrono::Duration::hours(24);
        let similar_24h = patterns
            .iter()
            .filter(|p| {
                chrono::NaiveDateTime::parse_from_str(&p.timestamp, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| {
                        chrono::NaiveDateTime::parse_from_str(&p.timestamp, "%Y-%m-%d %H:%M:%S")
                    })
                    .map(|ts| ts.and_utc() > cutoff)
                    .unwrap_or(false)
            })
            .count() as u64;

        let temporal_pattern = match similar_24h {
            0 => "isolated_event",
            1..=2 => "recurring",
            _ => "clustered",
        };

        GroupingAnalysis {
            temporal_pattern: temporal_pattern.to_string(),
            source_correlation: SourceCorrelation {
                ship_id: event.anomaly.ship_id.clone(),
                device_id: event.anomaly.device_id.clone(),
                related_devices: Vec::new(),
            },
            historical_patterns: HistoricalPatterns {
                similar_events_24h: similar_24h,
                pattern_type: if similar_24h > 0 {
                    "recurring_anomaly".to_string()
                } else {
                    "new_anomaly".to_string()
                },
            },
            aggregation_confidence: 0.8,
        }
    }

    async fn publish(&self, topic: &'static str, event: &EnrichedAnomalyEvent) {
        match self.bus.publish_json(topic, event).await {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
                warn!(topic, error = %e, tracking_id = %event.anomaly.tracking_id, "Enriched publish dropped");
            }
        }
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut deps = BTreeMap::new();
                    deps.insert("nats".to_string(), self.bus.is_connected());
                    deps.insert("device_registry".to_string(), self.registry.health_check().await);
                    let mut counters = BTreeMap::new();
                    counters.insert("stage1_processed".to_string(), self.counters.stage1_processed.load(Ordering::Relaxed));
                    counters.insert("stage2_processed".to_string(), self.counters.stage2_processed.load(Ordering::Relaxed));
                    counters.insert("published".to_string(), self.counters.published.load(Ordering::Relaxed));
                    counters.insert("parse_errors".to_string(), self.counters.parse_errors.load(Ordering::Relaxed));
                    counters.insert("publish_errors".to_string(), self.counters.publish_errors.load(Ordering::Relaxed));
                    self.health.report(deps, counters);
                    self.dedup.sweep();
                }
            }
        }
    }
}

/// Derive the coarse operational status from weather and host load.
///
/// First match wins: weather, then comms, then compute saturation.
pub fn derive_operational_status(weather: &WeatherImpact, load: &SystemLoad) -> OperationalStatus {
    if weather.rain_rate_mm_h > 5.0 || weather.wind_speed_kn > 30.0 {
        return OperationalStatus::WeatherImpacted;
    }
    if load.recent_packet_loss_pct > 5.0 || load.recent_latency_ms > 500.0 {
        return OperationalStatus::DegradedComms;
    }
    if load.cpu_pct > 80.0 && load.memory_pct > 80.0 {
        return OperationalStatus::SystemOverloaded;
    }
    OperationalStatus::Normal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rules_first_match_wins() {
        let calm = WeatherImpact::default();
        let idle = SystemLoad::default();
        assert_eq!(derive_operational_status(&calm, &idle), OperationalStatus::Normal);

        let storm = WeatherImpact {
            rain_rate_mm_h: 7.5,
            ..WeatherImpact::default()
        };
        assert_eq!(
            derive_operational_status(&storm, &idle),
            OperationalStatus::WeatherImpacted
        );

        let lossy = SystemLoad {
            recent_packet_loss_pct: 9.0,
            ..SystemLoad::default()
        };
        assert_eq!(
            derive_operational_status(&calm, &lossy),
            OperationalStatus::DegradedComms
        );

        let saturated = SystemLoad {
            cpu_pct: 92.0,
            memory_pct: 88.0,
            ..SystemLoad::default()
        };
        assert_eq!(
            derive_operational_status(&calm, &saturated),
            OperationalStatus::SystemOverloaded
        );

        // Weather outranks load when both apply
        assert_eq!(
            derive_operational_status(&storm, &saturated),
            OperationalStatus::WeatherImpacted
        );

        // CPU alone is not overload; both cpu and memory must exceed 80
        let cpu_only = SystemLoad {
            cpu_pct: 95.0,
            memory_pct: 40.0,
            ..SystemLoad::default()
        };
        assert_eq!(derive_operational_status(&calm, &cpu_only), OperationalStatus::Normal);
    }
}
