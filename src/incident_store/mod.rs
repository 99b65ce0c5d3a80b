//! Incident Store Client — columnar persistence for incidents
//!
//! Incidents live in `logs.incidents` on a `ReplacingMergeTree(updated_at)`
//! engine keyed by `incident_id`: re-inserting the same incident is a no-op
//! after merge, and updates are plain inserts with a newer `updated_at`,
//! giving idempotent writes and append-only timeline semantics without
//! mutations. Reads go through `FINAL` so callers always see the latest
//! version of each incident.

use crate::error::Result;
use crate::types::{Incident, IncidentStatus, Severity, TimelineEntry};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Idempotent DDL, applied at startup. Safe to run on every boot.
const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS logs",
    r"CREATE TABLE IF NOT EXISTS logs.incidents
(
    incident_id        String,
    correlation_id     String,
    tracking_id        String,
    incident_type      LowCardinality(String),
    incident_severity  LowCardinality(String),
    ship_id            LowCardinality(String),
    service            LowCardinality(String),
    metric_name        LowCardinality(String),
    metric_value       Float64,
    anomaly_score      Float64,
    detector           LowCardinality(String),
    status             LowCardinality(String),
    acknowledged       UInt8,
    created_at         DateTime64(3, 'UTC'),
    updated_at         DateTime64(3, 'UTC'),
    correlated_events  String,
    timeline           String,
    suggested_runbooks String,
    metadata           String,
    schema_version     UInt32
)
ENGINE = ReplacingMergeTree(updated_at)
ORDER BY incident_id
SETTINGS index_granularity = 8192",
];

/// Filters accepted by [`IncidentStoreClient::list`]
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub status: Option<IncidentStatus>,
    pub ship_id: Option<String>,
    pub limit: usize,
}

/// Counts returned by [`IncidentStoreClient::summary`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IncidentSummary {
    pub total_incidents: u64,
    pub open_incidents: u64,
    pub critical_incidents: u64,
    pub recent_incidents: Vec<Incident>,
}

#[derive(clickhouse::Row, Deserialize)]
struct IncidentRow {
    incident_id: String,
    correlation_id: String,
    tracking_id: String,
    incident_type: String,
    incident_severity: String,
    ship_id: String,
    service: String,
    metric_name: String,
    metric_value: f64,
    anomaly_score: f64,
    detector: String,
    status: String,
    acknowledged: u8,
    created_at: String,
    updated_at: String,
    correlated_events: String,
    timeline: String,
    suggested_runbooks: String,
    metadata: String,
    schema_version: u32,
}

const SELECT_COLUMNS: &str = "incident_id, correlation_id, tracking_id, incident_type, \
     incident_severity, ship_id, service, metric_name, metric_value, anomaly_score, \
     detector, status, acknowledged, toString(created_at) AS created_at, \
     toString(updated_at) AS updated_at, correlated_events, timeline, \
     suggested_runbooks, metadata, schema_version";

/// ClickHouse-backed incident store
#[derive(Clone)]
pub struct IncidentStoreClient {
    client: clickhouse::Client,
}

impl IncidentStoreClient {
    pub fn new(client: clickhouse::Client) -> Self {
        Self { client }
    }

    /// Build a ClickHouse client from the global settings.
    pub fn client_from_settings(settings: &crate::config::Settings) -> clickhouse::Client {
        clickhouse::Client::default()
            .with_url(&settings.endpoints.clickhouse_url)
            .with_user(&settings.endpoints.clickhouse_user)
            .with_password(&settings.endpoints.clickhouse_password)
    }

    /// Apply the idempotent schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        for ddl in MIGRATIONS {
            self.client.query(ddl).execute().await?;
        }
        info!("Incident store schema ensured");
        Ok(())
    }

    /// Insert an incident. Idempotent on `incident_id`: a replayed insert
    /// with the same `updated_at` collapses to a single row at merge time.
    pub async fn insert(&self, incident: &Incident) -> Result<()> {
        let sql = build_insert_sql(incident)?;
        self.client.query(&sql).execute().await?;
        debug!(
            incident_id = %incident.incident_id,
            severity = %incident.incident_severity,
            "Incident stored"
        );
        Ok(())
    }

    /// Fetch one incident by id.
    pub async fn get(&self, incident_id: &str) -> Result<Option<Incident>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM logs.incidents FINAL WHERE incident_id = ? LIMIT 1"
        );
        let rows = self
            .client
            .query(&sql)
            .bind(incident_id)
            .fetch_all::<IncidentRow>()
            .await?;
        Ok(rows.into_iter().next().map(row_to_incident))
    }

    /// List incidents, newest first.
    pub async fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM logs.incidents FINAL WHERE 1 = 1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.ship_id.is_some() {
            sql.push_str(" AND ship_id = ?");
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = self.client.query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(ref ship_id) = filter.ship_id {
            query = query.bind(ship_id.as_str());
        }
        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        query = query.bind(limit as u64);

        let rows = query.fetch_all::<IncidentRow>().await?;
        Ok(rows.into_iter().map(row_to_incident).collect())
    }

    /// Summary counts plus the ten most recent incidents.
    pub async fn summary(&self) -> Result<IncidentSummary> {
        let total = self.count("SELECT count() FROM logs.incidents FINAL").await?;
        let open = self
            .count("SELECT count() FROM logs.incidents FINAL WHERE status = 'open'")
            .await?;
        let critical = self
            .count("SELECT count() FROM logs.incidents FINAL WHERE incident_severity = 'critical'")
            .await?;
        let recent = self
            .list(&IncidentFilter {
                limit: 10,
                ..IncidentFilter::default()
            })
            .await?;

        Ok(IncidentSummary {
            total_incidents: total,
            open_incidents: open,
            critical_incidents: critical,
            recent_incidents: recent,
        })
    }

    /// Apply an update (status / acknowledgment / timeline append) as a
    /// re-insert with a newer `updated_at`. The timeline only ever grows.
    pub async fn update(
        &self,
        incident_id: &str,
        status: Option<IncidentStatus>,
        acknowledged: Option<bool>,
        timeline_entry: Option<TimelineEntry>,
    ) -> Result<Option<Incident>> {
        let Some(mut incident) = self.get(incident_id).await? else {
            return Ok(None);
        };

        if let Some(status) = status {
            incident.status = status;
        }
        if let Some(acknowledged) = acknowledged {
            incident.acknowledged = acknowledged;
        }
        if let Some(entry) = timeline_entry {
            incident.timeline.push(entry);
        }
        incident.updated_at = Utc::now();

        self.insert(&incident).await?;
        Ok(Some(incident))
    }

    async fn count(&self, sql: &str) -> Result<u64> {
        Ok(self.client.query(sql).fetch_one::<u64>().await?)
    }

    /// Probe connectivity with the cheapest possible query.
    pub async fn health_check(&self) -> bool {
        self.client.query("SELECT 1").fetch_one::<u8>().await.is_ok()
    }
}

/// Render an incident into an INSERT statement with escaped literals.
fn build_insert_sql(incident: &Incident) -> Result<String> {
    let correlated_events = serde_json::to_string(&incident.correlated_events)?;
    let timeline = serde_json::to_string(&incident.timeline)?;
    let runbooks = serde_json::to_string(&incident.suggested_runbooks)?;
    let metadata = serde_json::to_string(&incident.metadata)?;

    Ok(format!(
        "INSERT INTO logs.incidents (incident_id, correlation_id, tracking_id, \
         incident_type, incident_severity, ship_id, service, metric_name, metric_value, \
         anomaly_score, detector, status, acknowledged, created_at, updated_at, \
         correlated_events, timeline, suggested_runbooks, metadata, schema_version) VALUES \
         ('{}', '{}', '{}', '{}', '{}', '{}', '{}', '{}', {}, {}, '{}', '{}', {}, \
         '{}', '{}', '{}', '{}', '{}', '{}', {})",
        escape(&incident.incident_id),
        escape(&incident.correlation_id),
        escape(&incident.tracking_id),
        escape(&incident.incident_type),
        incident.incident_severity.as_str(),
        escape(&incident.ship_id),
        escape(&incident.service),
        escape(&incident.metric_name),
        sql_float(incident.metric_value),
        sql_float(incident.anomaly_score),
        escape(&incident.detector),
        incident.status.as_str(),
        u8::from(incident.acknowledged),
        format_datetime(incident.created_at),
        format_datetime(incident.updated_at),
        escape(&correlated_events),
        escape(&timeline),
        escape(&runbooks),
        escape(&metadata),
        incident.schema_version,
    ))
}

fn escape(input: &str) -> String {
    input.replace('\\', "\\\\").replace('\'', "\\'")
}

/// NaN/infinite floats have no SQL literal; store 0 rather than fail the row.
fn sql_float(value: f64) -> String {
    if value.is_finite() {
        format!("{value}")
    } else {
        "0".to_string()
    }
}

fn format_datetime(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| {
            warn!(raw, "Unparseable store timestamp — using epoch");
            DateTime::<Utc>::UNIX_EPOCH
        })
}

fn row_to_incident(row: IncidentRow) -> Incident {
    Incident {
        schema_version: row.schema_version,
        incident_id: row.incident_id,
        correlation_id: row.correlation_id,
        tracking_id: row.tracking_id,
        incident_type: row.incident_type,
        incident_severity: Severity::parse_lenient(&row.incident_severity),
        ship_id: row.ship_id,
        service: row.service,
        metric_name: row.metric_name,
        metric_value: row.metric_value,
        anomaly_score: row.anomaly_score,
        detector: row.detector,
        status: IncidentStatus::parse(&row.status).unwrap_or_default(),
        acknowledged: row.acknowledged != 0,
        created_at: parse_datetime(&row.created_at),
        updated_at: parse_datetime(&row.updated_at),
        correlated_events: serde_json::from_str(&row.correlated_events).unwrap_or_default(),
        timeline: serde_json::from_str(&row.timeline).unwrap_or_default(),
        suggested_runbooks: serde_json::from_str(&row.suggested_runbooks).unwrap_or_default(),
        metadata: serde_json::from_str(&row.metadata).unwrap_or_default(),
        extra: serde_json::Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SCHEMA_VERSION;

    fn sample_incident() -> Incident {
        Incident {
            schema_version: SCHEMA_VERSION,
            incident_id: "inc-1".to_string(),
            correlation_id: "corr-1".to_string(),
            tracking_id: "T1".to_string(),
            incident_type: "single_anomaly".to_string(),
            incident_severity: Severity::High,
            ship_id: "alpha-ship".to_string(),
            service: "node_exporter".to_string(),
            metric_name: "cpu_usage".to_string(),
            metric_value: 95.0,
            anomaly_score: 0.91,
            detector: "enhanced_detector".to_string(),
            status: IncidentStatus::Open,
            acknowledged: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            correlated_events: Vec::new(),
            timeline: vec![TimelineEntry::now(
                "incident_created",
                "correlated group opened",
                "correlator",
            )],
            suggested_runbooks: vec!["generic_investigation".to_string()],
            metadata: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn insert_sql_escapes_quotes() {
        let mut incident = sample_incident();
        incident.service = "it's-a-service".to_string();
        let sql = build_insert_sql(&incident).unwrap();
        assert!(sql.contains("it\\'s-a-service"));
        assert!(!sql.contains("it's-a-service"));
    }

    #[test]
    fn insert_sql_replaces_non_finite_floats() {
        let mut incident = sample_incident();
        incident.metric_value = f64::NAN;
        let sql = build_insert_sql(&incident).unwrap();
        assert!(!sql.contains("NaN"));
    }

    #[test]
    fn datetime_round_trip() {
        let now = Utc::now();
        let parsed = parse_datetime(&format_datetime(now));
        assert!((parsed - now).num_milliseconds().abs() <= 1);
    }

    #[test]
    fn unparseable_datetime_falls_back_to_epoch() {
        assert_eq!(parse_datetime("not-a-date"), DateTime::<Utc>::UNIX_EPOCH);
    }
}
