//! Shared data structures for the maritime anomaly pipeline
//!
//! This module defines the event model that flows across the bus topics:
//! - Stage E: `AnomalyEvent` (first-stage detection output)
//! - Stage F: `EnrichedAnomalyEvent` (context attached, two enrichment levels)
//! - Stage G/H: `Incident` (correlated group, persisted to the columnar store)
//!
//! All events carry a `tracking_id` propagated end-to-end from the first
//! record that entered the pipeline, and a `schema_version` tag. Unknown
//! JSON fields are preserved on pass-through via flattened maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Version tag stamped on every event produced by this process.
pub const SCHEMA_VERSION: u32 = 3;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Generate a fresh tracking id for events that enter the pipeline without one.
pub fn new_tracking_id() -> String {
    format!("trk-{}", uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Classification enums
// ============================================================================

/// Telemetry domain an event belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    #[default]
    System,
    Net,
    App,
}

impl Domain {
    /// Classify a metric name into a domain.
    ///
    /// `network`/`interface` metrics belong to `net`, `app` metrics to `app`,
    /// everything else (cpu, memory, disk, log anomalies) to `system`.
    pub fn classify(metric_name: &str) -> Self {
        let lower = metric_name.to_lowercase();
        if lower.contains("network") || lower.contains("interface") {
            Domain::Net
        } else if lower.contains("app") {
            Domain::App
        } else {
            Domain::System
        }
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Domain::System => write!(f, "system"),
            Domain::Net => write!(f, "net"),
            Domain::App => write!(f, "app"),
        }
    }
}

/// Severity / risk ladder shared by events, incidents, and remediation actions.
///
/// Ordering is meaningful: `Low < Medium < High < Critical`. Incident severity
/// only ever escalates (see the correlator), so `Ord` is derived and
/// escalation is `max()`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a score in [0,1] onto the risk ladder.
    pub fn from_score(score: f64) -> Self {
        if score > 0.8 {
            Severity::Critical
        } else if score > 0.6 {
            Severity::High
        } else if score > 0.4 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    /// Parse a severity string, mapping `info`/`debug` to `Low`.
    ///
    /// Unknown strings fall back to `Medium` so a malformed upstream label
    /// never drops an incident on the floor.
    pub fn parse_lenient(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "low" | "info" | "debug" => Severity::Low,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse operational label used by detectors and enrichers to modulate
/// thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationalStatus {
    #[default]
    Normal,
    WeatherImpacted,
    DegradedComms,
    SystemOverloaded,
    CriticalOperations,
}

impl std::fmt::Display for OperationalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationalStatus::Normal => "normal",
            OperationalStatus::WeatherImpacted => "weather_impacted",
            OperationalStatus::DegradedComms => "degraded_comms",
            OperationalStatus::SystemOverloaded => "system_overloaded",
            OperationalStatus::CriticalOperations => "critical_operations",
        };
        write!(f, "{s}")
    }
}

/// Incident lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    #[default]
    Open,
    Acknowledged,
    Investigating,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Acknowledged => "acknowledged",
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "open" => Some(IncidentStatus::Open),
            "acknowledged" => Some(IncidentStatus::Acknowledged),
            "investigating" => Some(IncidentStatus::Investigating),
            "resolved" => Some(IncidentStatus::Resolved),
            "closed" => Some(IncidentStatus::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Enrichment stage a processed event has passed through
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CorrelationLevel {
    #[serde(rename = "level_1_enriched")]
    Level1Enriched,
    #[serde(rename = "level_2_enhanced")]
    Level2Enhanced,
}

// ============================================================================
// Stage E: first-stage anomaly events
// ============================================================================

/// Anomaly event emitted by the detector on `anomaly.detected`.
///
/// Invariant at emission time: `score >= threshold`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyEvent {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub tracking_id: String,
    pub timestamp: DateTime<Utc>,
    pub ship_id: String,
    pub device_id: String,
    pub service: String,
    pub domain: Domain,
    /// Detection family, e.g. `statistical_with_baseline` or `log_pattern`
    pub anomaly_type: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub score: f64,
    /// Identifier of the detector that produced the event
    pub detector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_msg: Option<String>,
    /// Free-form scalar metadata (score breakdown, baselines, source host, …)
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Unknown upstream fields, preserved on pass-through
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// Stage F: enriched events
// ============================================================================

/// Weather snapshot attached by the enricher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WeatherImpact {
    /// Rain rate in mm/h; > 5 counts as heavy precipitation
    pub rain_rate_mm_h: f64,
    pub wind_speed_kn: f64,
    pub wave_height_m: f64,
    pub temperature_c: f64,
    /// Where the snapshot came from (`weather_api`, `none`)
    pub source: String,
}

/// Host load snapshot attached by the enricher
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemLoad {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub recent_packet_loss_pct: f64,
    pub recent_latency_ms: f64,
}

/// Context block assembled during first-stage enrichment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EnrichmentContext {
    /// Device registry mapping for the source host, when resolvable
    #[serde(default)]
    pub device_context: Map<String, Value>,
    #[serde(default)]
    pub weather_impact: WeatherImpact,
    #[serde(default)]
    pub system_load: SystemLoad,
    /// Optional output of the external enhancement endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<Value>,
}

/// Voyage context block
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MaritimeContext {
    pub operational_status: OperationalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Per-event grouping analysis computed during second-stage enrichment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupingAnalysis {
    /// `isolated_event`, `recurring`, or `clustered`
    pub temporal_pattern: String,
    pub source_correlation: SourceCorrelation,
    pub historical_patterns: HistoricalPatterns,
    pub aggregation_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SourceCorrelation {
    pub ship_id: String,
    pub device_id: String,
    #[serde(default)]
    pub related_devices: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HistoricalPatterns {
    pub similar_events_24h: u64,
    pub pattern_type: String,
}

/// Anomaly event with attached context, emitted on
/// `anomaly.detected.enriched` (level 1) and
/// `anomaly.detected.enriched.final` (level 2).
///
/// Invariant: `anomaly.tracking_id` equals the originating event's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnrichedAnomalyEvent {
    #[serde(flatten)]
    pub anomaly: AnomalyEvent,
    pub enrichment_context: EnrichmentContext,
    pub maritime_context: MaritimeContext,
    pub correlation_level: CorrelationLevel,
    /// Identifiers of the sources that contributed context
    #[serde(default)]
    pub context_sources: BTreeSet<String>,
    // --- Level 2 additions ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grouping_analysis: Option<GroupingAnalysis>,
}

impl EnrichedAnomalyEvent {
    /// Effective score: the enhanced score when stage 2 produced one,
    /// otherwise the detector score.
    pub fn effective_score(&self) -> f64 {
        self.enhanced_score.unwrap_or(self.anomaly.score)
    }

    /// Effective risk: the stage-2 assessment when present, otherwise the
    /// ladder applied to the effective score.
    pub fn effective_risk(&self) -> Severity {
        self.risk_level
            .unwrap_or_else(|| Severity::from_score(self.effective_score()))
    }
}

/// In-process feedback from the enricher to the detector: the latest
/// operational status and weather, used to modulate detection thresholds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationalSnapshot {
    pub status: OperationalStatus,
    pub weather: WeatherImpact,
}

// ============================================================================
// Stage G/H: incidents
// ============================================================================

/// Compact summary of a contributing event, stored on the incident
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelatedEventSummary {
    pub tracking_id: String,
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub metric_value: f64,
    pub score: f64,
    pub risk_level: Severity,
    pub detector: String,
}

impl From<&EnrichedAnomalyEvent> for CorrelatedEventSummary {
    fn from(event: &EnrichedAnomalyEvent) -> Self {
        Self {
            tracking_id: event.anomaly.tracking_id.clone(),
            timestamp: event.anomaly.timestamp,
            metric_name: event.anomaly.metric_name.clone(),
            metric_value: event.anomaly.metric_value,
            score: event.effective_score(),
            risk_level: event.effective_risk(),
            detector: event.anomaly.detector.clone(),
        }
    }
}

/// Append-only timeline entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    /// Short event tag, e.g. `incident_created`, `status_changed`
    pub event: String,
    pub description: String,
    pub source: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TimelineEntry {
    pub fn now(event: &str, description: &str, source: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.to_string(),
            description: description.to_string(),
            source: source.to_string(),
            metadata: Map::new(),
        }
    }
}

/// Correlated incident, emitted on `incidents.created` and persisted by the
/// incident writer.
///
/// Invariants:
/// - `incident_severity` only escalates as events join the group
/// - `timeline` is append-only
/// - `correlated_events` are deduplicated by `tracking_id`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub incident_id: String,
    /// Grouping key id assigned by the correlator, one per window
    pub correlation_id: String,
    /// Tracking id of the first contributing event
    pub tracking_id: String,
    pub incident_type: String,
    pub incident_severity: Severity,
    pub ship_id: String,
    pub service: String,
    pub metric_name: String,
    pub metric_value: f64,
    pub anomaly_score: f64,
    pub detector: String,
    pub status: IncidentStatus,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub correlated_events: Vec<CorrelatedEventSummary>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    #[serde(default)]
    pub suggested_runbooks: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Unknown upstream fields, preserved on pass-through
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// Bus input: raw log records from the log router
// ============================================================================

/// Raw record on `logs.anomalous`, as shipped by the external log router.
///
/// The router's schema is not under our control; everything beyond the
/// minimum contract is captured in `extra` and preserved.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LogRecord {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly_severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ship_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub labels: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ladder_boundaries() {
        assert_eq!(Severity::from_score(0.95), Severity::Critical);
        assert_eq!(Severity::from_score(0.8), Severity::High);
        assert_eq!(Severity::from_score(0.61), Severity::High);
        assert_eq!(Severity::from_score(0.6), Severity::Medium);
        assert_eq!(Severity::from_score(0.41), Severity::Medium);
        assert_eq!(Severity::from_score(0.4), Severity::Low);
        assert_eq!(Severity::from_score(0.0), Severity::Low);
    }

    #[test]
    fn severity_escalates_monotonically() {
        let mut sev = Severity::Low;
        sev = sev.max(Severity::High);
        assert_eq!(sev, Severity::High);
        // A later lower-risk event never de-escalates
        sev = sev.max(Severity::Medium);
        assert_eq!(sev, Severity::High);
    }

    #[test]
    fn severity_parse_maps_info_debug_to_low() {
        assert_eq!(Severity::parse_lenient("info"), Severity::Low);
        assert_eq!(Severity::parse_lenient("debug"), Severity::Low);
        assert_eq!(Severity::parse_lenient("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse_lenient("garbled"), Severity::Medium);
    }

    #[test]
    fn domain_classification() {
        assert_eq!(Domain::classify("cpu_usage"), Domain::System);
        assert_eq!(Domain::classify("network_latency"), Domain::Net);
        assert_eq!(Domain::classify("interface_errors"), Domain::Net);
        assert_eq!(Domain::classify("app_request_rate"), Domain::App);
    }

    #[test]
    fn anomaly_event_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "tracking_id": "T1",
            "timestamp": "2026-03-01T12:00:00Z",
            "ship_id": "alpha-ship",
            "device_id": "alpha-bridge-01",
            "service": "node_exporter",
            "domain": "system",
            "anomaly_type": "statistical_with_baseline",
            "metric_name": "cpu_usage",
            "metric_value": 95.0,
            "threshold": 0.7,
            "score": 0.91,
            "detector": "enhanced_detector",
            "vendor_tag": "keep-me"
        });
        let event: AnomalyEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            event.extra.get("vendor_tag").and_then(Value::as_str),
            Some("keep-me")
        );
        let round = serde_json::to_value(&event).unwrap();
        assert_eq!(round.get("vendor_tag").and_then(Value::as_str), Some("keep-me"));
    }

    #[test]
    fn correlation_level_wire_names() {
        let l1 = serde_json::to_string(&CorrelationLevel::Level1Enriched).unwrap();
        assert_eq!(l1, "\"level_1_enriched\"");
        let l2 = serde_json::to_string(&CorrelationLevel::Level2Enhanced).unwrap();
        assert_eq!(l2, "\"level_2_enhanced\"");
    }
}
