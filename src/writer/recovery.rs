//! Cascading field recovery for incoming incident payloads
//!
//! Upstream correlators are not the only producers of `incidents.created`;
//! payloads arrive with fields missing, misplaced in `metadata`/`labels`, or
//! encoded inside the raw message. Every resolver here walks a fixed cascade
//! and returns `(value, source_tag)`; the tags land in
//! `metadata.field_sources` so a stored incident is auditable.

use crate::registry::{derive_ship_id, DeviceRegistryClient};
use crate::types::Severity;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::{debug, info};

/// A recovered value and where the cascade found it
pub type Recovered<T> = (T, &'static str);

fn get_str<'a>(raw: &'a Value, pointer: &str) -> Option<&'a str> {
    raw.pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

/// Hostname as seen anywhere in the payload, in priority order.
pub fn extract_hostname(raw: &Value) -> Option<String> {
    for pointer in [
        "/host",
        "/hostname",
        "/labels/instance",
        "/metadata/host",
        "/metadata/hostname",
        "/metadata/source_host",
    ] {
        if let Some(host) = get_str(raw, pointer) {
            return Some(host.to_string());
        }
    }
    None
}

/// Resolve ship identity: registry first (source of truth), then a valid
/// incoming field, then hostname derivation, then `unknown-ship`.
pub async fn resolve_ship_id(
    raw: &Value,
    registry: &DeviceRegistryClient,
) -> Recovered<String> {
    let hostname = extract_hostname(raw);

    if let Some(ref host) = hostname {
        if let Some(mapping) = registry.lookup(host).await {
            info!(host, ship_id = %mapping.ship_id, "Ship id resolved via registry");
            return (mapping.ship_id, "device_registry");
        }
    }

    if let Some(ship_id) = get_str(raw, "/ship_id").filter(|s| !s.starts_with("unknown")) {
        return (ship_id.to_string(), "incoming_field");
    }

    if let Some(host) = hostname {
        let derived = if host.contains('-') {
            derive_ship_id(&host)
        } else {
            host
        };
        return (derived, "hostname_derivation");
    }

    debug!("No ship id or hostname anywhere in payload");
    ("unknown-ship".to_string(), "fallback")
}

/// Resolve the owning service name.
pub fn resolve_service(raw: &Value) -> Recovered<String> {
    if let Some(service) = get_str(raw, "/service").filter(|s| *s != "unknown_service") {
        return (service.to_string(), "incoming_field");
    }
    if let Some(service) = get_str(raw, "/metadata/service") {
        return (service.to_string(), "metadata");
    }
    if let Some(service) = get_str(raw, "/metadata/application") {
        return (service.to_string(), "metadata_application");
    }
    if let Some(service) = get_str(raw, "/labels/job") {
        return (service.to_string(), "labels_job");
    }
    if let Some(service) = get_str(raw, "/labels/service") {
        return (service.to_string(), "labels");
    }

    let detector = get_str(raw, "/detector")
        .or_else(|| get_str(raw, "/detector_name"))
        .unwrap_or("")
        .to_lowercase();
    if detector.contains("log") {
        return ("log_service".to_string(), "detector_inference");
    }
    if detector.contains("network") {
        return ("network_service".to_string(), "detector_inference");
    }

    ("unknown_service".to_string(), "fallback")
}

/// Resolve the metric name, scanning metadata, labels, the message body, and
/// finally inferring from the anomaly/detector shape.
pub fn resolve_metric_name(raw: &Value) -> Recovered<String> {
    if let Some(name) = get_str(raw, "/metric_name").filter(|s| *s != "unknown_metric") {
        return (name.to_string(), "incoming_field");
    }
    if let Some(name) = get_str(raw, "/metadata/metric_name") {
        return (name.to_string(), "metadata");
    }
    if let Some(name) = get_str(raw, "/labels/metric_name") {
        return (name.to_string(), "labels");
    }

    let message = message_text(raw);
    static NAME_RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::unwrap_used)]
    let name_re = NAME_RE.get_or_init(|| Regex::new(r"metric_name=(\S+)").unwrap());
    if let Some(cap) = name_re.captures(&message) {
        return (cap[1].to_string(), "message_scan");
    }

    let anomaly_type = get_str(raw, "/anomaly_type").unwrap_or("").to_lowercase();
    let detector = get_str(raw, "/detector")
        .or_else(|| get_str(raw, "/detector_name"))
        .unwrap_or("")
        .to_lowercase();
    let message_lower = message.to_lowercase();

    if anomaly_type.contains("log") || detector.contains("log") {
        return ("log_anomaly".to_string(), "type_inference");
    }
    if message_lower.contains("cpu") {
        return ("cpu_usage".to_string(), "message_inference");
    }
    if message_lower.contains("memory") {
        return ("memory_usage".to_string(), "message_inference");
    }
    if detector.contains("network") {
        return ("network_metric".to_string(), "detector_inference");
    }

    let (service, _) = resolve_service(raw);
    if service != "unknown_service" {
        return (format!("{service}_metric"), "service_inference");
    }

    ("unknown_metric".to_string(), "fallback")
}

/// Numeric recovery: typed field, string parse, metadata, then a regex walk
/// over the message (explicit `metric_value=`, percentages, byte sizes,
/// counts, last-resort decimals).
pub fn resolve_metric_value(raw: &Value) -> Recovered<f64> {
    if let Some(value) = raw.get("metric_value").and_then(numeric) {
        if value != 0.0 {
            return (value, "incoming_field");
        }
    }
    if let Some(value) = raw.pointer("/metadata/metric_value").and_then(numeric) {
        return (value, "metadata");
    }

    let message = message_text(raw);
    if !message.is_empty() {
        static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
        #[allow(clippy::unwrap_used)]
        let patterns = PATTERNS.get_or_init(|| {
            vec![
                (Regex::new(r"metric_value=([\d.eE+-]+)").unwrap(), "message_explicit"),
                (Regex::new(r"([\d.]+)\s*%").unwrap(), "message_percent"),
                (Regex::new(r"(?i)([\d.]+)\s*GB").unwrap(), "message_bytes"),
                (Regex::new(r"(?i)([\d.]+)\s*MB").unwrap(), "message_bytes"),
                (Regex::new(r"(?i)count:\s*(\d+)").unwrap(), "message_count"),
                (Regex::new(r"([\d.]+)").unwrap(), "message_decimal"),
            ]
        });
        for (pattern, tag) in patterns {
            if let Some(cap) = pattern.captures(&message) {
                if let Ok(value) = cap[1].parse::<f64>() {
                    return (value, tag);
                }
            }
        }
    }

    (0.0, "fallback")
}

/// Anomaly score recovery: typed or string-encoded number, else 0.
pub fn resolve_anomaly_score(raw: &Value) -> Recovered<f64> {
    if let Some(score) = raw.get("anomaly_score").and_then(numeric) {
        return (score, "incoming_field");
    }
    if let Some(score) = raw.pointer("/metadata/anomaly_score").and_then(numeric) {
        return (score, "metadata");
    }
    (0.0, "fallback")
}

/// Severity with `info`/`debug` mapped to `low`.
pub fn resolve_severity(raw: &Value) -> Recovered<Severity> {
    if let Some(severity) = get_str(raw, "/incident_severity") {
        return (Severity::parse_lenient(severity), "incoming_field");
    }
    if let Some(severity) = get_str(raw, "/severity") {
        return (Severity::parse_lenient(severity), "severity_field");
    }
    (Severity::Medium, "fallback")
}

/// Accept numbers and numeric strings.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn message_text(raw: &Value) -> String {
    get_str(raw, "/message")
        .or_else(|| get_str(raw, "/raw_msg"))
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn offline_registry() -> DeviceRegistryClient {
        DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn ship_id_prefers_existing_valid_field_when_registry_down() {
        let raw = json!({"ship_id": "alpha-ship", "host": "alpha-bridge-01"});
        let (ship, source) = resolve_ship_id(&raw, &offline_registry()).await;
        assert_eq!(ship, "alpha-ship");
        assert_eq!(source, "incoming_field");
    }

    #[tokio::test]
    async fn ship_id_derives_from_hostname_when_field_unknown() {
        let raw = json!({"ship_id": "unknown-ship", "metadata": {"source_host": "beta-engine-02"}});
        let (ship, source) = resolve_ship_id(&raw, &offline_registry()).await;
        assert_eq!(ship, "beta-ship");
        assert_eq!(source, "hostname_derivation");
    }

    #[tokio::test]
    async fn ship_id_falls_back_to_unknown() {
        let raw = json!({"incident_id": "x"});
        let (ship, source) = resolve_ship_id(&raw, &offline_registry()).await;
        assert_eq!(ship, "unknown-ship");
        assert_eq!(source, "fallback");
    }

    #[test]
    fn service_cascade() {
        let raw = json!({"metadata": {"application": "nav-console"}});
        assert_eq!(resolve_service(&raw), ("nav-console".to_string(), "metadata_application"));

        let raw = json!({"labels": {"job": "node"}});
        assert_eq!(resolve_service(&raw), ("node".to_string(), "labels_job"));

        let raw = json!({"detector_name": "log_pattern_detector"});
        assert_eq!(resolve_service(&raw), ("log_service".to_string(), "detector_inference"));
    }

    #[test]
    fn metric_name_from_message_scan() {
        let raw = json!({"message": "alert metric_name=satellite_snr below floor"});
        assert_eq!(
            resolve_metric_name(&raw),
            ("satellite_snr".to_string(), "message_scan")
        );
    }

    #[test]
    fn metric_name_inferred_from_log_detector() {
        let raw = json!({"detector": "log_pattern_detector"});
        assert_eq!(resolve_metric_name(&raw), ("log_anomaly".to_string(), "type_inference"));
    }

    #[test]
    fn metric_value_accepts_numeric_strings() {
        let raw = json!({"metric_value": "93.5"});
        assert_eq!(resolve_metric_value(&raw), (93.5, "incoming_field"));
    }

    #[test]
    fn metric_value_from_percentage_in_message() {
        let raw = json!({"metric_value": 0, "message": "CPU at 87% on bridge node"});
        assert_eq!(resolve_metric_value(&raw), (87.0, "message_percent"));
    }

    #[test]
    fn metric_value_explicit_beats_other_patterns() {
        let raw = json!({"message": "metric_value=42.5 seen at 99%"});
        assert_eq!(resolve_metric_value(&raw), (42.5, "message_explicit"));
    }

    #[test]
    fn metric_value_last_resort_decimal() {
        let raw = json!({"message": "retried 7 times"});
        assert_eq!(resolve_metric_value(&raw), (7.0, "message_decimal"));
    }

    #[test]
    fn severity_maps_info_to_low() {
        let raw = json!({"incident_severity": "info"});
        assert_eq!(resolve_severity(&raw), (Severity::Low, "incoming_field"));
    }
}
