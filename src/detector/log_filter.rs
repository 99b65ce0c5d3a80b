//! Log-pattern path: filter raw anomalous-log records and score survivors
//!
//! The external log router pre-screens syslog into `logs.anomalous`, but its
//! screen is permissive; this module applies the second filter (level gate +
//! normal-operational patterns), assigns a score from the level/severity
//! ladder, resolves ship/device identity, and builds the outgoing event.

use crate::config::defaults::LOG_ANOMALY_THRESHOLD;
use crate::registry::{derive_ship_id, DeviceRegistryClient};
use crate::types::{new_tracking_id, AnomalyEvent, Domain, LogRecord, SCHEMA_VERSION};
use regex::RegexSet;
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

/// Messages matching any of these never create anomalies, regardless of level.
fn normal_operational_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        #[allow(clippy::unwrap_used)]
        RegexSet::new([
            r"(?i)Metric: .+ = \d+",
            r"(?i)Health check",
            r"(?i)Status: OK",
            r"(?i)Connection established",
            r"(?i)Startup complete",
            r"(?i)Heartbeat",
            r"(?i)Process started",
            r"(?i)Configuration loaded",
        ])
        .unwrap()
    })
}

/// Why a record was dropped before scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// INFO/DEBUG/TRACE level with low-grade severity
    NonCritical,
    /// Matched a normal-operational pattern
    OperationalNoise,
}

/// Decide whether a record should be scored at all.
pub fn filter(record: &LogRecord) -> Option<SkipReason> {
    let level = record.level.to_uppercase();
    let severity = record
        .anomaly_severity
        .as_deref()
        .unwrap_or("low")
        .to_lowercase();

    if matches!(level.as_str(), "INFO" | "DEBUG" | "TRACE")
        && matches!(severity.as_str(), "info" | "low" | "debug")
    {
        return Some(SkipReason::NonCritical);
    }

    if normal_operational_patterns().is_match(&record.message) {
        return Some(SkipReason::OperationalNoise);
    }

    None
}

/// Level/severity ladder: fatal 0.95, error 0.85, warn 0.75, else 0.6.
pub fn score(record: &LogRecord) -> f64 {
    let level = record.level.to_uppercase();
    let severity = record
        .anomaly_severity
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if matches!(level.as_str(), "FATAL" | "CRITICAL") || severity == "critical" {
        0.95
    } else if level == "ERROR" || matches!(severity.as_str(), "high" | "error") {
        0.85
    } else if matches!(level.as_str(), "WARN" | "WARNING")
        || matches!(severity.as_str(), "medium" | "warning")
    {
        0.75
    } else {
        0.6
    }
}

fn metadata_source_host(record: &LogRecord) -> Option<&str> {
    record
        .metadata
        .get("source_host")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty() && *s != "unknown" && *s != record.host)
}

/// Resolve ship identity: direct field, registry by host, registry by
/// metadata source host, hostname derivation, labels, `unknown-ship`.
pub async fn resolve_ship_id(record: &LogRecord, registry: &DeviceRegistryClient) -> String {
    if let Some(ship_id) = record.ship_id.as_deref().filter(|s| !s.is_empty()) {
        return ship_id.to_string();
    }

    if !record.host.is_empty() && record.host != "unknown" {
        if let Some(mapping) = registry.lookup(&record.host).await {
            debug!(host = %record.host, ship_id = %mapping.ship_id, "Ship resolved via registry");
            return mapping.ship_id;
        }
    }

    if let Some(source_host) = metadata_source_host(record) {
        if let Some(mapping) = registry.lookup(source_host).await {
            debug!(source_host, ship_id = %mapping.ship_id, "Ship resolved via source host");
            return mapping.ship_id;
        }
    }

    if !record.host.is_empty() && record.host != "unknown" {
        return derive_ship_id(&record.host);
    }

    if let Some(ship_id) = record.labels.get("ship_id").and_then(Value::as_str) {
        return ship_id.to_string();
    }

    "unknown-ship".to_string()
}

/// Resolve device identity: direct field, registry lookups, hostname,
/// service name, `unknown-device`.
pub async fn resolve_device_id(record: &LogRecord, registry: &DeviceRegistryClient) -> String {
    if let Some(device_id) = record.device_id.as_deref().filter(|s| !s.is_empty()) {
        return device_id.to_string();
    }

    if !record.host.is_empty() && record.host != "unknown" {
        if let Some(mapping) = registry.lookup(&record.host).await {
            return mapping.device_id;
        }
    }

    if let Some(source_host) = metadata_source_host(record) {
        if let Some(mapping) = registry.lookup(source_host).await {
            return mapping.device_id;
        }
    }

    if !record.host.is_empty() && record.host != "unknown" {
        return record.host.clone();
    }

    if let Some(service) = record.service.as_deref().filter(|s| !s.is_empty() && *s != "unknown") {
        return service.to_string();
    }

    "unknown-device".to_string()
}

/// Build the outgoing event for a record that passed the filter.
pub async fn build_event(record: &LogRecord, registry: &DeviceRegistryClient) -> AnomalyEvent {
    let tracking_id = record
        .tracking_id
        .clone()
        .filter(|t| !t.is_empty())
        .unwrap_or_else(new_tracking_id);

    let ship_id = resolve_ship_id(record, registry).await;
    let device_id = resolve_device_id(record, registry).await;
    let service = record
        .service
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let mut meta = Map::new();
    meta.insert("log_level".to_string(), Value::from(record.level.clone()));
    meta.insert("source_host".to_string(), Value::from(record.host.clone()));
    meta.insert(
        "anomaly_severity".to_string(),
        Value::from(record.anomaly_severity.clone().unwrap_or_else(|| "low".to_string())),
    );
    if let Some(ref ts) = record.timestamp {
        meta.insert("original_timestamp".to_string(), Value::from(ts.clone()));
    }

    AnomalyEvent {
        schema_version: SCHEMA_VERSION,
        tracking_id,
        timestamp: chrono::Utc::now(),
        ship_id,
        device_id,
        service,
        domain: Domain::System,
        anomaly_type: "log_pattern".to_string(),
        metric_name: "log_anomaly".to_string(),
        metric_value: 1.0,
        threshold: LOG_ANOMALY_THRESHOLD,
        score: score(record),
        detector: "log_pattern_detector".to_string(),
        raw_msg: Some(record.message.clone()),
        meta,
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(message: &str, level: &str, host: &str) -> LogRecord {
        LogRecord {
            message: message.to_string(),
            level: level.to_string(),
            host: host.to_string(),
            ..LogRecord::default()
        }
    }

    fn offline_registry() -> DeviceRegistryClient {
        DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn info_low_records_are_skipped() {
        let r = LogRecord {
            anomaly_severity: Some("info".to_string()),
            ..record("disk at 40%", "INFO", "alpha-bridge-01")
        };
        assert_eq!(filter(&r), Some(SkipReason::NonCritical));
    }

    #[test]
    fn health_check_skipped_regardless_of_level() {
        let r = record("Health check OK", "ERROR", "alpha-bridge-01");
        assert_eq!(filter(&r), Some(SkipReason::OperationalNoise));
    }

    #[test]
    fn error_with_real_message_passes_filter() {
        let r = record("Engine coolant pump FAILED (SIGTERM)", "ERROR", "alpha-engine-02");
        assert_eq!(filter(&r), None);
    }

    #[test]
    fn metric_echo_skipped() {
        let r = record("Metric: cpu_usage = 42", "WARN", "alpha-bridge-01");
        assert_eq!(filter(&r), Some(SkipReason::OperationalNoise));
    }

    #[test]
    fn score_ladder() {
        assert_eq!(score(&record("x", "FATAL", "h")), 0.95);
        assert_eq!(score(&record("x", "ERROR", "h")), 0.85);
        assert_eq!(score(&record("x", "WARN", "h")), 0.75);
        assert_eq!(score(&record("x", "NOTICE", "h")), 0.6);
        let critical_sev = LogRecord {
            anomaly_severity: Some("critical".to_string()),
            ..record("x", "WARN", "h")
        };
        assert_eq!(score(&critical_sev), 0.95);
    }

    #[tokio::test]
    async fn build_event_derives_ship_and_keeps_tracking_id() {
        let registry = offline_registry();
        let r = LogRecord {
            tracking_id: Some("T1".to_string()),
            ..record("Engine coolant pump FAILED (SIGTERM)", "ERROR", "alpha-engine-02")
        };
        let event = build_event(&r, &registry).await;
        assert_eq!(event.tracking_id, "T1");
        assert_eq!(event.score, 0.85);
        assert_eq!(event.ship_id, "alpha-ship");
        assert_eq!(event.device_id, "alpha-engine-02");
        assert_eq!(event.domain, Domain::System);
        assert_eq!(event.metric_name, "log_anomaly");
        assert!(event.score >= event.threshold);
    }

    #[tokio::test]
    async fn build_event_generates_tracking_id_when_missing() {
        let registry = offline_registry();
        let event = build_event(&record("pump failure", "ERROR", "beta-deck-03"), &registry).await;
        assert!(!event.tracking_id.is_empty());
        assert_eq!(event.ship_id, "beta-ship");
    }
}
