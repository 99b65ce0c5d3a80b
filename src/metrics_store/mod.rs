//! Metrics Store Client — instantaneous values, baselines, history
//!
//! Two backends sit behind this component:
//! - the metrics TSDB (`GET /api/v1/query`) for instantaneous values and
//!   aggregate-over-time baselines
//! - the columnar log store for correlation patterns and incident
//!   resolution history
//!
//! Baselines are cached per `(ship_id, metric)` and recomputed at most once
//! per detection cycle; entries older than six hours are stale and refetched.

use crate::config::defaults::BASELINE_STALE_SECS;
use crate::error::{PipelineError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// One sample from an instant query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstantSample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    pub timestamp: f64,
}

/// Historical aggregate for one metric on one ship
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Baseline {
    pub avg: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub sample_count: u64,
}

impl Baseline {
    /// An empty baseline carries no signal and is skipped by the detector.
    pub fn is_empty(&self) -> bool {
        self.sample_count == 0
    }

    /// Deviation score against the p95/p99 band: 0 below p95, scaling to 1
    /// as the value approaches p99.
    pub fn deviation_score(&self, value: f64) -> f64 {
        if self.is_empty() || value <= self.p95 {
            return 0.0;
        }
        ((value - self.p95) / (self.p99 - self.p95 + 0.001)).min(1.0)
    }
}

/// Historical event matching a current anomaly's shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationPattern {
    pub message: String,
    pub host: String,
    pub service: String,
    pub timestamp: String,
    pub hourly_count: u64,
}

/// Resolved incident of a similar type, used for runbook hints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionRecord {
    pub incident_id: String,
    pub incident_type: String,
    pub incident_severity: String,
    pub created_at: String,
}

// Wire shapes of the TSDB query API
#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySeries>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    /// `[unix_ts, "value"]`
    value: (f64, String),
}

#[derive(clickhouse::Row, Deserialize)]
struct PatternRow {
    message: String,
    host: String,
    service: String,
    ts: String,
    hourly_count: u64,
}

#[derive(clickhouse::Row, Deserialize)]
struct ResolutionRow {
    incident_id: String,
    incident_type: String,
    incident_severity: String,
    created_at: String,
}

struct CachedBaseline {
    baseline: Baseline,
    fetched_at: chrono::DateTime<chrono::Utc>,
}

/// Client over the TSDB and the columnar history
pub struct MetricsStoreClient {
    http: reqwest::Client,
    base_url: String,
    columnar: clickhouse::Client,
    baseline_cache: DashMap<(String, String), CachedBaseline>,
}

impl MetricsStoreClient {
    pub fn new(base_url: &str, columnar: clickhouse::Client) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            columnar,
            baseline_cache: DashMap::new(),
        }
    }

    /// Execute an instant query and flatten the result series.
    ///
    /// Transport and decode failures propagate so the detector can log and
    /// skip the cycle.
    pub async fn instant(&self, query: &str) -> Result<Vec<InstantSample>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query),
                ("time", &chrono::Utc::now().timestamp().to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PipelineError::Transport(format!(
                "metrics store returned {}",
                response.status()
            )));
        }

        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(PipelineError::Schema(format!(
                "query status `{}`",
                body.status
            )));
        }

        let mut samples = Vec::new();
        for series in body.data.map(|d| d.result).unwrap_or_default() {
            let (ts, raw) = series.value;
            match raw.parse::<f64>() {
                Ok(value) => samples.push(InstantSample {
                    labels: series.metric,
                    value,
                    timestamp: ts,
                }),
                Err(_) => {
                    warn!(query, raw, "Skipping unparseable sample value");
                }
            }
        }
        Ok(samples)
    }

    /// Historical baseline for `metric` on `ship_id` over the trailing
    /// `days`, excluding the most recent hour.
    ///
    /// Cached; entries older than six hours are recomputed. Returns an empty
    /// baseline (never an error) when history is missing or the store is
    /// unreachable — the detector degrades to statistical scores only.
    pub async fn baseline(&self, ship_id: &str, metric: &str, days: u32) -> Baseline {
        let key = (ship_id.to_string(), metric.to_string());
        if let Some(cached) = self.baseline_cache.get(&key) {
            let age = chrono::Utc::now() - cached.fetched_at;
            if age.num_seconds() < BASELINE_STALE_SECS {
                return cached.baseline;
            }
        }

        let baseline = match self.fetch_baseline(ship_id, metric, days).await {
            Ok(b) => b,
            Err(e) => {
                debug!(metric, ship_id, error = %e, "Baseline unavailable");
                Baseline::default()
            }
        };

        if !baseline.is_empty() {
            self.baseline_cache.insert(
                key,
                CachedBaseline {
                    baseline,
                    fetched_at: chrono::Utc::now(),
                },
            );
        }
        baseline
    }

    async fn fetch_baseline(&self, ship_id: &str, metric: &str, days: u32) -> Result<Baseline> {
        let selector = if ship_id.is_empty() || ship_id.starts_with("unknown") {
            metric.to_string()
        } else {
            format!("{metric}{{ship_id=\"{ship_id}\"}}")
        };
        let range = format!("[{days}d] offset 1h");

        let avg = self.aggregate(&format!("avg_over_time({selector}{range})")).await?;
        let median = self
            .aggregate(&format!("quantile_over_time(0.5, {selector}{range})"))
            .await?;
        let p95 = self
            .aggregate(&format!("quantile_over_time(0.95, {selector}{range})"))
            .await?;
        let p99 = self
            .aggregate(&format!("quantile_over_time(0.99, {selector}{range})"))
            .await?;
        let count = self
            .aggregate(&format!("count_over_time({selector}{range})"))
            .await?;

        Ok(Baseline {
            avg: avg.unwrap_or(0.0),
            median: median.unwrap_or(0.0),
            p95: p95.unwrap_or(0.0),
            p99: p99.unwrap_or(0.0),
            sample_count: count.unwrap_or(0.0).max(0.0) as u64,
        })
    }

    /// Run an aggregate query and take the first sample's value.
    async fn aggregate(&self, query: &str) -> Result<Option<f64>> {
        Ok(self.instant(query).await?.first().map(|s| s.value))
    }

    /// Historical log events resembling the current anomaly: error-ish
    /// messages, plus raw metric echoes for the same metric, over 30 days.
    pub async fn correlation_patterns(
        &self,
        metric_name: &str,
        limit: usize,
    ) -> Vec<CorrelationPattern> {
        let sql = format!(
            "SELECT message, host, service, toString(timestamp) AS ts, \
             COUNT(*) OVER (PARTITION BY toStartOfHour(timestamp)) AS hourly_count \
             FROM logs.raw \
             WHERE source IN ('syslog', 'host_metrics', 'snmp') \
               AND (message ILIKE '%error%' OR message ILIKE '%critical%' \
                    OR message ILIKE '%fail%' \
                    OR (source = 'host_metrics' AND message LIKE '%{}%')) \
               AND timestamp >= now() - INTERVAL 30 DAY \
               AND timestamp <= now() - INTERVAL 1 HOUR \
             ORDER BY timestamp DESC LIMIT {limit}",
            escape_like(metric_name),
        );

        match self.columnar.query(&sql).fetch_all::<PatternRow>().await {
            Ok(rows) => rows
                .into_iter()
                .map(|r| CorrelationPattern {
                    message: r.message,
                    host: r.host,
                    service: r.service,
                    timestamp: r.ts,
                    hourly_count: r.hourly_count,
                })
                .collect(),
            Err(e) => {
                debug!(metric_name, error = %e, "Correlation pattern query failed");
                Vec::new()
            }
        }
    }

    /// Resolved incidents of a similar type over the last 90 days.
    pub async fn resolution_history(&self, anomaly_type: &str, limit: usize) -> Vec<ResolutionRecord> {
        let sql = format!(
            "SELECT incident_id, incident_type, incident_severity, \
             toString(created_at) AS created_at \
             FROM logs.incidents FINAL \
             WHERE incident_type ILIKE '%{}%' \
               AND status = 'resolved' \
               AND created_at >= now() - INTERVAL 90 DAY \
             ORDER BY created_at DESC LIMIT {limit}",
            escape_like(anomaly_type),
        );

        match self.columnar.query(&sql).fetch_all::<ResolutionRow>().await {
            Ok(rows) => rows
                .into_iter()
                .map(|r| ResolutionRecord {
                    incident_id: r.incident_id,
                    incident_type: r.incident_type,
                    incident_severity: r.incident_severity,
                    created_at: r.created_at,
                })
                .collect(),
            Err(e) => {
                debug!(anomaly_type, error = %e, "Resolution history query failed");
                Vec::new()
            }
        }
    }

    /// Probe the TSDB health endpoint.
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Escape quotes and LIKE wildcards for inlined ClickHouse string literals.
fn escape_like(input: &str) -> String {
    input
        .replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_baseline_scores_zero() {
        let baseline = Baseline::default();
        assert!(baseline.is_empty());
        assert_eq!(baseline.deviation_score(1000.0), 0.0);
    }

    #[test]
    fn deviation_score_scales_between_p95_and_p99() {
        let baseline = Baseline {
            avg: 20.0,
            median: 20.0,
            p95: 50.0,
            p99: 90.0,
            sample_count: 1000,
        };
        assert_eq!(baseline.deviation_score(40.0), 0.0);
        assert_eq!(baseline.deviation_score(50.0), 0.0);
        let mid = baseline.deviation_score(70.0);
        assert!(mid > 0.4 && mid < 0.6, "mid-band score was {mid}");
        assert_eq!(baseline.deviation_score(200.0), 1.0);
    }

    #[test]
    fn escape_like_neutralizes_quotes_and_wildcards() {
        assert_eq!(escape_like("cpu_usage"), "cpu\\_usage");
        assert_eq!(escape_like("a'b"), "a\\'b");
        assert_eq!(escape_like("50%"), "50\\%");
    }

    #[test]
    fn instant_response_parses_prometheus_shape() {
        let raw = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"instance": "alpha-bridge-01", "job": "node"},
                     "value": [1767000000.0, "42.5"]}
                ]
            }
        }"#;
        let parsed: QueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "success");
        let series = &parsed.data.unwrap().result[0];
        assert_eq!(series.metric.get("job").map(String::as_str), Some("node"));
        assert_eq!(series.value.1, "42.5");
    }
}
