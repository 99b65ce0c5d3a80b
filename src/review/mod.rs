//! Post-incident review: root-cause analysis over stored incidents
//!
//! Scores an incident's textual evidence (timeline, correlated events, raw
//! messages) against per-category keyword/error-code patterns, weighs the
//! incident duration against each category's typical band, and folds in the
//! recorded system context. Output is a primary cause with evidence,
//! contributing factors, a confidence score, and follow-up recommendations.
//!
//! Pure functions over an [`Incident`]; the API layer fetches and delegates.

use crate::types::{Incident, IncidentStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root cause taxonomy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RootCauseCategory {
    HardwareFailure,
    SoftwareBug,
    ConfigurationError,
    NetworkIssue,
    CapacityLimit,
    ExternalDependency,
    EnvironmentalFactor,
    HumanError,
}

impl RootCauseCategory {
    pub const ALL: [RootCauseCategory; 8] = [
        RootCauseCategory::HardwareFailure,
        RootCauseCategory::SoftwareBug,
        RootCauseCategory::ConfigurationError,
        RootCauseCategory::NetworkIssue,
        RootCauseCategory::CapacityLimit,
        RootCauseCategory::ExternalDependency,
        RootCauseCategory::EnvironmentalFactor,
        RootCauseCategory::HumanError,
    ];
}

/// Evidence pattern for one category
struct CausePattern {
    keywords: &'static [&'static str],
    error_codes: &'static [&'static str],
    /// Typical incident duration band in minutes
    typical_duration_minutes: (f64, f64),
}

fn pattern(category: RootCauseCategory) -> CausePattern {
    match category {
        RootCauseCategory::HardwareFailure => CausePattern {
            keywords: &["disk", "memory", "cpu", "power", "temperature", "fan"],
            error_codes: &["ecc", "smart", "thermal"],
            typical_duration_minutes: (60.0, 480.0),
        },
        RootCauseCategory::SoftwareBug => CausePattern {
            keywords: &["exception", "segfault", "crash", "memory leak", "deadlock"],
            error_codes: &["sigsegv", "outofmemoryerror", "nullpointerexception"],
            typical_duration_minutes: (5.0, 120.0),
        },
        RootCauseCategory::ConfigurationError => CausePattern {
            keywords: &["config", "parameter", "setting", "timeout", "limit"],
            error_codes: &["config_error", "invalid_param"],
            typical_duration_minutes: (10.0, 60.0),
        },
        RootCauseCategory::NetworkIssue => CausePattern {
            keywords: &["network", "connection", "timeout", "packet loss", "latency"],
            error_codes: &["network_unreachable", "connection_timeout"],
            typical_duration_minutes: (5.0, 240.0),
        },
        RootCauseCategory::CapacityLimit => CausePattern {
            keywords: &["capacity", "limit", "quota", "full", "overload"],
            error_codes: &["quota_exceeded", "capacity_limit"],
            typical_duration_minutes: (30.0, 180.0),
        },
        RootCauseCategory::ExternalDependency => CausePattern {
            keywords: &["external", "api", "service", "dependency", "third party"],
            error_codes: &["service_unavailable", "api_error"],
            typical_duration_minutes: (15.0, 720.0),
        },
        RootCauseCategory::EnvironmentalFactor => CausePattern {
            keywords: &["weather", "temperature", "humidity", "vibration", "shock"],
            error_codes: &["environmental_alarm"],
            typical_duration_minutes: (60.0, 1440.0),
        },
        RootCauseCategory::HumanError => CausePattern {
            keywords: &["manual", "operator", "mistake", "incorrect", "wrong"],
            error_codes: &["user_error", "manual_override"],
            typical_duration_minutes: (5.0, 60.0),
        },
    }
}

fn recommendations(category: RootCauseCategory) -> Vec<String> {
    let items: &[&str] = match category {
        RootCauseCategory::HardwareFailure => &[
            "Schedule preventive hardware maintenance",
            "Enable predictive hardware monitoring alerts",
            "Review hardware redundancy for the affected device",
        ],
        RootCauseCategory::SoftwareBug => &[
            "File a defect with the captured stack context",
            "Add regression coverage for the failing path",
        ],
        RootCauseCategory::ConfigurationError => &[
            "Audit recent configuration changes",
            "Add validation for the offending parameter",
        ],
        RootCauseCategory::NetworkIssue => &[
            "Run link diagnostics on the affected path",
            "Review QoS and failover policy for the route",
        ],
        RootCauseCategory::CapacityLimit => &[
            "Review capacity headroom for the affected resource",
            "Tune alert thresholds to fire before saturation",
        ],
        RootCauseCategory::ExternalDependency => &[
            "Review timeout and fallback behavior for the dependency",
            "Raise the issue with the external provider",
        ],
        RootCauseCategory::EnvironmentalFactor => &[
            "Correlate with weather and sea-state records",
            "Review equipment environmental tolerances",
        ],
        RootCauseCategory::HumanError => &[
            "Review the operating procedure with the crew",
            "Add guardrails for the manual step involved",
        ],
    };
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Result of a root-cause review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub incident_id: String,
    pub primary_cause: RootCauseCategory,
    pub contributing_factors: Vec<RootCauseCategory>,
    pub confidence_score: f64,
    pub evidence: Vec<String>,
    pub recommendations: Vec<String>,
    /// Minutes from creation to resolution, when the incident is resolved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<f64>,
}

/// Flatten every piece of incident text into one lowercase haystack.
fn evidence_text(incident: &Incident) -> String {
    let mut text = String::new();
    text.push_str(&incident.metric_name);
    text.push(' ');
    text.push_str(&incident.incident_type);
    for entry in &incident.timeline {
        text.push(' ');
        text.push_str(&entry.description);
        text.push(' ');
        text.push_str(&entry.event);
    }
    for event in &incident.correlated_events {
        text.push(' ');
        text.push_str(&event.metric_name);
        text.push(' ');
        text.push_str(&event.detector);
    }
    for value in incident.metadata.values() {
        if let Value::String(s) = value {
            text.push(' ');
            text.push_str(s);
        }
    }
    text.to_lowercase()
}

fn duration_minutes(incident: &Incident) -> Option<f64> {
    if matches!(incident.status, IncidentStatus::Resolved | IncidentStatus::Closed) {
        let minutes = (incident.updated_at - incident.created_at).num_seconds() as f64 / 60.0;
        (minutes >= 0.0).then_some(minutes)
    } else {
        None
    }
}

/// Score an incident against every root-cause pattern and pick the winner.
pub fn analyze(incident: &Incident) -> RootCauseAnalysis {
    let haystack = evidence_text(incident);
    let duration = duration_minutes(incident);

    // System context recorded by the enricher, when present
    let cpu = incident
        .metadata
        .get("system_load")
        .and_then(|load| load.get("cpu_pct"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    let packet_loss = incident
        .metadata
        .get("system_load")
        .and_then(|load| load.get("recent_packet_loss_pct"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0);

    let mut best: Option<(RootCauseCategory, f64, Vec<String>)> = None;
    let mut scores = Vec::with_capacity(RootCauseCategory::ALL.len());

    for category in RootCauseCategory::ALL {
        let pattern = pattern(category);
        let mut score = 0.0;
        let mut evidence = Vec::new();

        for keyword in pattern.keywords {
            if haystack.contains(keyword) {
                score += 1.0;
                evidence.push(format!("Keyword found: {keyword}"));
            }
        }
        // Error codes are more specific than keywords
        for code in pattern.error_codes {
            if haystack.contains(code) {
                score += 2.0;
                evidence.push(format!("Error code found: {code}"));
            }
        }
        if let Some(minutes) = duration {
            let (min, max) = pattern.typical_duration_minutes;
            if (min..=max).contains(&minutes) {
                score += 1.0;
                evidence.push(format!("Duration matches pattern: {minutes:.1} min"));
            }
        }
        if category == RootCauseCategory::HardwareFailure && cpu > 95.0 {
            score += 1.5;
            evidence.push("High CPU usage recorded".to_string());
        }
        if category == RootCauseCategory::NetworkIssue && packet_loss > 1.0 {
            score += 2.0;
            evidence.push(format!("Packet loss recorded: {packet_loss}%"));
        }

        scores.push((category, score));
        let replace = best.as_ref().map_or(true, |(_, top, _)| score > *top);
        if replace {
            best = Some((category, score, evidence));
        }
    }

    // `best` is always set: ALL is non-empty
    let (primary_cause, primary_score, evidence) =
        best.unwrap_or((RootCauseCategory::SoftwareBug, 0.0, Vec::new()));

    let contributing_factors = scores
        .iter()
        .filter(|(category, score)| {
            *category != primary_cause && *score > primary_score * 0.5 && *score > 0.0
        })
        .map(|(category, _)| *category)
        .collect();

    RootCauseAnalysis {
        incident_id: incident.incident_id.clone(),
        primary_cause,
        contributing_factors,
        confidence_score: (primary_score / 5.0).min(1.0),
        evidence,
        recommendations: recommendations(primary_cause),
        duration_minutes: duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Severity, TimelineEntry, SCHEMA_VERSION};
    use chrono::Utc;

    fn incident(descriptions: &[&str], status: IncidentStatus, minutes: i64) -> Incident {
        let created = Utc::now() - chrono::Duration::minutes(minutes);
        Incident {
            schema_version: SCHEMA_VERSION,
            incident_id: "inc-T1".to_string(),
            correlation_id: "corr-1".to_string(),
            tracking_id: "T1".to_string(),
            incident_type: "single_anomaly".to_string(),
            incident_severity: Severity::High,
            ship_id: "alpha-ship".to_string(),
            service: "node_exporter".to_string(),
            metric_name: "cpu_usage".to_string(),
            metric_value: 97.0,
            anomaly_score: 0.9,
            detector: "enhanced_detector".to_string(),
            status,
            acknowledged: true,
            created_at: created,
            updated_at: Utc::now(),
            correlated_events: Vec::new(),
            timeline: descriptions
                .iter()
                .map(|d| TimelineEntry::now("observation", d, "test"))
                .collect(),
            suggested_runbooks: Vec::new(),
            metadata: serde_json::Map::new(),
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn network_evidence_wins_over_defaults() {
        let analysis = analyze(&incident(
            &[
                "packet loss climbing on uplink",
                "connection timeout to shore gateway",
                "NETWORK_UNREACHABLE from edge router",
            ],
            IncidentStatus::Resolved,
            45,
        ));
        assert_eq!(analysis.primary_cause, RootCauseCategory::NetworkIssue);
        assert!(analysis.confidence_score > 0.5);
        assert!(analysis
            .evidence
            .iter()
            .any(|e| e.contains("network_unreachable")));
        assert!(analysis.duration_minutes.is_some());
    }

    #[test]
    fn open_incident_has_no_duration_evidence() {
        let analysis = analyze(&incident(
            &["disk temperature alarm on array"],
            IncidentStatus::Open,
            45,
        ));
        assert!(analysis.duration_minutes.is_none());
        assert_eq!(analysis.primary_cause, RootCauseCategory::HardwareFailure);
    }

    #[test]
    fn contributing_factors_exclude_primary_and_zeroes() {
        let analysis = analyze(&incident(
            &["config timeout raised after manual operator change"],
            IncidentStatus::Resolved,
            20,
        ));
        assert!(!analysis
            .contributing_factors
            .contains(&analysis.primary_cause));
    }

    #[test]
    fn recommendations_follow_primary_cause() {
        let analysis = analyze(&incident(
            &["quota exceeded: storage pool full"],
            IncidentStatus::Resolved,
            60,
        ));
        assert_eq!(analysis.primary_cause, RootCauseCategory::CapacityLimit);
        assert!(analysis
            .recommendations
            .iter()
            .any(|r| r.contains("capacity headroom")));
    }
}
