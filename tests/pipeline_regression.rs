//! Pipeline Regression Tests
//!
//! Exercises the detection → enrichment → correlation chain in-process with
//! no external services: statistical spike detection, the log-pattern path
//! with identity fallbacks, rule-based stage-2 scoring, and windowed
//! correlation. Asserts the pipeline-wide invariants (tracking id
//! propagation, score ≥ threshold, incident count ≤ event count).

use shipsight::correlator::GroupTable;
use shipsight::detector::log_filter;
use shipsight::detector::statistical::DetectorBank;
use shipsight::enricher::enhancement::rule_based_analysis;
use shipsight::types::{
    AnomalyEvent, CorrelationLevel, EnrichedAnomalyEvent, EnrichmentContext, LogRecord,
    MaritimeContext, Severity,
};
use shipsight::DeviceRegistryClient;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

fn offline_registry() -> DeviceRegistryClient {
    DeviceRegistryClient::new(
        "http://127.0.0.1:1",
        Duration::from_secs(300),
        Duration::from_millis(50),
    )
}

fn enrich_for_test(anomaly: AnomalyEvent) -> EnrichedAnomalyEvent {
    let mut event = EnrichedAnomalyEvent {
        anomaly,
        enrichment_context: EnrichmentContext::default(),
        maritime_context: MaritimeContext::default(),
        correlation_level: CorrelationLevel::Level1Enriched,
        context_sources: BTreeSet::new(),
        enhanced_score: None,
        risk_level: None,
        urgency: None,
        recommendations: Vec::new(),
        system_impact: None,
        grouping_analysis: None,
    };
    let analysis = rule_based_analysis(&event);
    event.enhanced_score = Some(analysis.enhanced_score);
    event.risk_level = Some(analysis.risk_level);
    event.correlation_level = CorrelationLevel::Level2Enhanced;
    event
}

/// Statistical detection scenario: a stable cpu window then a 95 spike must
/// clear a 0.7 threshold.
#[test]
fn cpu_spike_after_stable_window_exceeds_threshold() {
    let mut bank = DetectorBank::new(50, 0.3, 3.0, 3.5);
    for value in [20.0, 22.0, 21.0, 23.0, 22.0, 21.0, 22.0, 23.0, 22.0, 21.0] {
        let scores = bank.update_and_detect("cpu_usage", value);
        let max = scores.values().copied().fold(0.0_f64, f64::max);
        assert!(max < 0.7, "stable value {value} scored {max}");
    }

    let scores = bank.update_and_detect("cpu_usage", 95.0);
    let max = scores.values().copied().fold(0.0_f64, f64::max);
    assert!(max >= 0.7, "spike scored only {max}");
}

/// Log filter scenario: an operational health-check line never becomes an
/// anomaly, whatever its level.
#[test]
fn health_check_log_is_dropped() {
    let record = LogRecord {
        message: "Health check OK".to_string(),
        level: "INFO".to_string(),
        host: "alpha-bridge-01".to_string(),
        ..LogRecord::default()
    };
    assert!(log_filter::filter(&record).is_some());
}

/// Log scoring scenario: an engine failure at ERROR scores 0.85, derives the
/// ship from the hostname, and keeps the inbound tracking id.
#[tokio::test]
async fn engine_failure_log_scores_and_propagates_tracking_id() {
    let record = LogRecord {
        message: "Engine coolant pump FAILED (SIGTERM)".to_string(),
        level: "ERROR".to_string(),
        host: "alpha-engine-02".to_string(),
        tracking_id: Some("T1".to_string()),
        ..LogRecord::default()
    };
    assert!(log_filter::filter(&record).is_none());

    let registry = offline_registry();
    let event = log_filter::build_event(&record, &registry).await;
    assert_eq!(event.score, 0.85);
    assert_eq!(event.ship_id, "alpha-ship");
    assert_eq!(event.tracking_id, "T1");
    assert_eq!(event.domain, shipsight::Domain::System);
    assert!(event.score >= event.threshold);
}

/// Correlation scenario: three same-signature events inside the window fold
/// into a single incident carrying all three summaries.
#[tokio::test]
async fn three_events_one_incident() {
    let registry = offline_registry();
    let start = Instant::now();
    let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));

    let mut produced = Vec::new();
    for (i, tracking_id) in ["T1", "T2", "T3"].iter().enumerate() {
        let record = LogRecord {
            message: "Engine coolant pump FAILED (SIGTERM)".to_string(),
            level: "ERROR".to_string(),
            host: "alpha-engine-02".to_string(),
            service: Some("engine-monitor".to_string()),
            tracking_id: Some((*tracking_id).to_string()),
            ..LogRecord::default()
        };
        let anomaly = log_filter::build_event(&record, &registry).await;
        let enriched = enrich_for_test(anomaly);
        assert!(table.observe(enriched, start + Duration::from_secs(20 * i as u64)));
        produced.push(tracking_id);
    }

    // Within the window and not yet idle: nothing closes
    assert!(table.close_due(start + Duration::from_secs(50)).is_empty());

    let incidents = table.close_due(start + Duration::from_secs(400));
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert!(incident.correlated_events.len() >= 3);
    assert_eq!(incident.tracking_id, "T1");
    assert!(!incident.correlation_id.is_empty());

    // Unique inputs ⇒ incidents ≤ anomaly events
    assert!(incidents.len() <= produced.len());
}

/// Redelivered events (same tracking id) never inflate a group.
#[tokio::test]
async fn replayed_stream_yields_same_incident_set() {
    let registry = offline_registry();
    let start = Instant::now();
    let mut table = GroupTable::new(Duration::from_secs(300), Duration::from_secs(30));

    let record = LogRecord {
        message: "Engine coolant pump FAILED (SIGTERM)".to_string(),
        level: "ERROR".to_string(),
        host: "alpha-engine-02".to_string(),
        tracking_id: Some("T1".to_string()),
        ..LogRecord::default()
    };
    let event = enrich_for_test(log_filter::build_event(&record, &registry).await);

    assert!(table.observe(event.clone(), start));
    // Replay of the same input
    assert!(!table.observe(event, start + Duration::from_secs(1)));

    let incidents = table.close_due(start + Duration::from_secs(400));
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].correlated_events.len(), 1);
    assert_eq!(incidents[0].incident_id, "inc-T1");
}

/// Stage-2 invariants: the rule-based scorer keeps scores in [0,1] and the
/// risk ladder is consistent with the enhanced score.
#[tokio::test]
async fn rule_based_enhancement_is_bounded_and_consistent() {
    let registry = offline_registry();
    for level in ["WARN", "ERROR", "CRITICAL"] {
        let record = LogRecord {
            message: "power distribution safety interlock tripped".to_string(),
            level: level.to_string(),
            host: "alpha-power-01".to_string(),
            ..LogRecord::default()
        };
        let event = enrich_for_test(log_filter::build_event(&record, &registry).await);
        let score = event.enhanced_score.unwrap();
        assert!((0.0..=1.0).contains(&score), "score {score} out of bounds");
        assert_eq!(event.risk_level.unwrap(), Severity::from_score(score));
        assert_eq!(event.correlation_level, CorrelationLevel::Level2Enhanced);
    }
}
