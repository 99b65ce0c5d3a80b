//! Settings tree deserialized from `shipsight.toml`.
//!
//! Every section and field carries a serde default so a partial file (or no
//! file at all) yields a fully usable configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub endpoints: EndpointSettings,
    pub detection: DetectionSettings,
    /// Contextual base thresholds per metric name
    pub thresholds: ThresholdSettings,
    pub correlator: CorrelatorSettings,
    pub remediation: RemediationSettings,
    pub device_registry: DeviceRegistrySettings,
    pub shutdown: ShutdownSettings,
}

impl Settings {
    /// Load settings using the documented order:
    /// `SHIPSIGHT_CONFIG` env var, `./shipsight.toml`, built-in defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("SHIPSIGHT_CONFIG") {
            return Self::load_from(&path);
        }
        if Path::new("shipsight.toml").exists() {
            return Self::load_from("shipsight.toml");
        }
        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load from an explicit path, falling back to defaults on any error.
    pub fn load_from(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str::<Settings>(&raw) {
                Ok(settings) => {
                    info!(path, "Loaded configuration");
                    settings
                }
                Err(e) => {
                    warn!(path, error = %e, "Config file invalid — using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path, error = %e, "Config file unreadable — using defaults");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// HTTP bind address for the API surface
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Endpoints and credentials for every external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub nats_url: String,
    pub metrics_store_url: String,
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub device_registry_url: String,
    pub policy_engine_url: String,
    /// OPA-style data path queried for decisions
    pub policy_namespace: String,
    /// Optional weather provider; empty disables weather context
    pub weather_url: String,
    /// Optional enhancement (model generation) endpoint; empty disables it
    pub enhancement_url: String,
    pub enhancement_model: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            nats_url: "nats://nats:4222".to_string(),
            metrics_store_url: "http://victoria-metrics:8428".to_string(),
            clickhouse_url: "http://clickhouse:8123".to_string(),
            clickhouse_database: "logs".to_string(),
            clickhouse_user: "default".to_string(),
            clickhouse_password: String::new(),
            device_registry_url: "http://device-registry:8080".to_string(),
            policy_engine_url: "http://opa:8181".to_string(),
            policy_namespace: "remediation".to_string(),
            weather_url: String::new(),
            enhancement_url: String::new(),
            enhancement_model: "llama2".to_string(),
        }
    }
}

/// One metric pulled from the metrics store every detection cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    pub query: String,
    pub threshold: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub cycle_seconds: u64,
    pub window_size: usize,
    pub ewma_alpha: f64,
    pub zscore_divisor: f64,
    pub mad_divisor: f64,
    pub queries: Vec<MetricQuery>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            cycle_seconds: 10,
            window_size: 50,
            ewma_alpha: 0.3,
            zscore_divisor: 3.0,
            mad_divisor: 3.5,
            queries: vec![
                MetricQuery {
                    name: "cpu_usage".to_string(),
                    query: "100 - (avg(irate(node_cpu_seconds_total{mode=\"idle\"}[5m])) * 100)"
                        .to_string(),
                    threshold: 0.7,
                    enabled: true,
                },
                MetricQuery {
                    name: "memory_usage".to_string(),
                    query:
                        "(1 - (node_memory_MemAvailable_bytes / node_memory_MemTotal_bytes)) * 100"
                            .to_string(),
                    threshold: 0.6,
                    enabled: true,
                },
                MetricQuery {
                    name: "disk_usage".to_string(),
                    query: "100 - ((node_filesystem_avail_bytes{mountpoint=\"/\"} / node_filesystem_size_bytes{mountpoint=\"/\"}) * 100)"
                        .to_string(),
                    threshold: 0.8,
                    enabled: true,
                },
            ],
        }
    }
}

/// Per-metric base thresholds used by contextual adjustment.
///
/// Values are in the metric's native unit (ratios for usage metrics, dB for
/// SNR, ms for latency, percent for loss).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdSettings {
    pub base: BTreeMap<String, f64>,
    /// Fallback when a metric has no entry in `base`
    pub default: f64,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        let mut base = BTreeMap::new();
        base.insert("cpu_usage".to_string(), 0.70);
        base.insert("memory_usage".to_string(), 0.60);
        base.insert("disk_usage".to_string(), 0.80);
        base.insert("satellite_snr".to_string(), 15.0);
        base.insert("satellite_ber".to_string(), 0.001);
        base.insert("network_latency".to_string(), 200.0);
        base.insert("network_packet_loss".to_string(), 1.0);
        Self {
            base,
            default: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorSettings {
    pub window_seconds: u64,
    pub idle_close_seconds: u64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            window_seconds: 300,
            idle_close_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemediationSettings {
    pub approval_ttl_seconds: u64,
    pub rate_limit_window_seconds: u64,
    pub dry_run_default: bool,
}

impl Default for RemediationSettings {
    fn default() -> Self {
        Self {
            approval_ttl_seconds: 1800,
            rate_limit_window_seconds: 3600,
            dry_run_default: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceRegistrySettings {
    pub cache_ttl_seconds: u64,
    pub lookup_timeout_ms: u64,
}

impl Default for DeviceRegistrySettings {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
            lookup_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSettings {
    /// In-flight work is given this long after a shutdown signal
    pub grace_seconds: u64,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self { grace_seconds: 10 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.detection.cycle_seconds, 10);
        assert_eq!(s.detection.window_size, 50);
        assert!((s.detection.ewma_alpha - 0.3).abs() < f64::EPSILON);
        assert_eq!(s.correlator.window_seconds, 300);
        assert_eq!(s.correlator.idle_close_seconds, 30);
        assert_eq!(s.remediation.approval_ttl_seconds, 1800);
        assert!(s.remediation.dry_run_default);
        assert_eq!(s.device_registry.cache_ttl_seconds, 300);
        assert_eq!(s.thresholds.base.get("cpu_usage"), Some(&0.70));
    }

    #[test]
    fn partial_toml_fills_missing_sections() {
        let partial = r#"
            [correlator]
            window_seconds = 120
        "#;
        let s: Settings = toml::from_str(partial).unwrap();
        assert_eq!(s.correlator.window_seconds, 120);
        // untouched sections keep defaults
        assert_eq!(s.correlator.idle_close_seconds, 30);
        assert_eq!(s.detection.queries.len(), 3);
    }
}
