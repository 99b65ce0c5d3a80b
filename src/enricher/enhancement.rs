//! Second-stage enhancement: external model endpoint with a deterministic
//! rule-based fallback
//!
//! The external endpoint is a policy-controlled plugin: it gets a bounded
//! deadline (10 s) and its free-text answer is parsed for risk/urgency
//! tokens. Any timeout, transport error, or unconfigured endpoint falls back
//! to the rule-based scorer, so stage 2 output is always produced and
//! reproducible in tests.

use crate::types::{EnrichedAnomalyEvent, OperationalStatus, Severity};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Keywords that mark a log message as touching a critical ship system
const CRITICAL_KEYWORDS: &[&str] = &["engine", "navigation", "communication", "power", "safety"];

/// Outcome of stage-2 analysis, whichever path produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancedAnalysis {
    pub enhanced_score: f64,
    pub risk_level: Severity,
    pub urgency: String,
    pub recommendations: Vec<String>,
    pub system_impact: String,
    pub confidence: f64,
    /// `model_enhanced` or `rule_based_enhanced`
    pub analysis_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

pub struct EnhancementClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
}

impl EnhancementClient {
    /// An empty `base_url` disables the endpoint; analysis is then always
    /// rule-based.
    pub fn new(base_url: &str, model: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty()
    }

    /// Analyze an enriched event. Never fails; the fallback path covers
    /// every error.
    pub async fn analyze(&self, event: &EnrichedAnomalyEvent) -> EnhancedAnalysis {
        if !self.is_configured() {
            return rule_based_analysis(event);
        }

        match self.generate(event).await {
            Ok(text) => parse_model_response(&text, event),
            Err(e) => {
                warn!(error = %e, "Enhancement endpoint failed — using rule-based fallback");
                rule_based_analysis(event)
            }
        }
    }

    async fn generate(&self, event: &EnrichedAnomalyEvent) -> Result<String, reqwest::Error> {
        let prompt = format!(
            "Analyze this maritime anomaly event and provide enhanced context:\n\
             - Tracking ID: {}\n- Ship: {}\n- Metric: {} = {}\n- Score: {:.3}\n\
             - Operational status: {}\n- Message: {}\n\
             Provide: enhanced anomaly score (0.0-1.0), risk assessment \
             (low/medium/high/critical), system impact, recommendations, urgency.",
            event.anomaly.tracking_id,
            event.anomaly.ship_id,
            event.anomaly.metric_name,
            event.anomaly.metric_value,
            event.anomaly.score,
            event.maritime_context.operational_status,
            event.anomaly.raw_msg.as_deref().unwrap_or("N/A"),
        );

        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model: &self.model,
                prompt,
                stream: false,
            })
            .send()
            .await?
            .error_for_status()?;

        let body: GenerateResponse = response.json().await?;
        Ok(body.response)
    }
}

/// Parse the model's free text for risk/urgency tokens; the structure of the
/// answer is not trusted beyond keyword presence.
fn parse_model_response(text: &str, event: &EnrichedAnomalyEvent) -> EnhancedAnalysis {
    let lower = text.to_lowercase();
    let original = event.anomaly.score;

    let (enhanced_score, risk_level) = if lower.contains("critical") {
        ((original * 1.5).min(1.0), Severity::Critical)
    } else if lower.contains("high") {
        ((original * 1.3).min(1.0), Severity::High)
    } else if lower.contains("medium") {
        ((original * 1.1).min(1.0), Severity::Medium)
    } else {
        (original, Severity::Low)
    };

    let mut recommendations = Vec::new();
    if lower.contains("investigate") {
        recommendations.push("immediate_investigation".to_string());
    }
    if lower.contains("maintenance") {
        recommendations.push("schedule_maintenance".to_string());
    }
    if lower.contains("monitor") {
        recommendations.push("enhanced_monitoring".to_string());
    }
    if recommendations.is_empty() {
        recommendations.push("standard_monitoring".to_string());
    }

    debug!(score = enhanced_score, risk = %risk_level, "Model analysis parsed");
    EnhancedAnalysis {
        enhanced_score,
        risk_level,
        urgency: urgency(enhanced_score, risk_level),
        recommendations,
        system_impact: system_impact(enhanced_score),
        confidence: 0.9,
        analysis_method: "model_enhanced".to_string(),
        raw_response: Some(text.to_string()),
    }
}

/// Deterministic scorer used whenever the endpoint is missing or down.
pub fn rule_based_analysis(event: &EnrichedAnomalyEvent) -> EnhancedAnalysis {
    let mut score = event.anomaly.score;
    let message = event
        .anomaly
        .raw_msg
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    score *= match event.maritime_context.operational_status {
        OperationalStatus::CriticalOperations => 1.3,
        OperationalStatus::DegradedComms | OperationalStatus::SystemOverloaded => 1.1,
        _ => 1.0,
    };

    if CRITICAL_KEYWORDS.iter().any(|k| message.contains(k)) {
        score *= 1.2;
    }
    score = score.min(1.0);

    let risk_level = Severity::from_score(score);

    let mut recommendations = Vec::new();
    if score > 0.8 {
        recommendations.push("immediate_investigation".to_string());
        recommendations.push("escalate_to_operations".to_string());
    } else if score > 0.6 {
        recommendations.push("investigate_within_hour".to_string());
        recommendations.push("notify_technical_team".to_string());
    } else {
        recommendations.push("monitor_closely".to_string());
    }
    if message.contains("database") {
        recommendations.push("check_database_connectivity".to_string());
    } else if message.contains("network") {
        recommendations.push("verify_network_status".to_string());
    } else if message.contains("engine") {
        recommendations.push("engine_diagnostics".to_string());
    }

    EnhancedAnalysis {
        enhanced_score: score,
        risk_level,
        urgency: urgency(score, risk_level),
        recommendations,
        system_impact: system_impact(score),
        confidence: 0.7,
        analysis_method: "rule_based_enhanced".to_string(),
        raw_response: None,
    }
}

fn system_impact(score: f64) -> String {
    if score > 0.8 {
        "system_wide".to_string()
    } else if score > 0.6 {
        "subsystem_affected".to_string()
    } else {
        "localized".to_string()
    }
}

fn urgency(score: f64, risk: Severity) -> String {
    if risk == Severity::Critical || score > 0.9 {
        "immediate".to_string()
    } else if risk == Severity::High || score > 0.7 {
        "urgent".to_string()
    } else if risk == Severity::Medium {
        "normal".to_string()
    } else {
        "low".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnomalyEvent, CorrelationLevel, Domain, EnrichmentContext, MaritimeContext,
        SCHEMA_VERSION,
    };
    use serde_json::Map;
    use std::collections::BTreeSet;

    fn enriched(score: f64, status: OperationalStatus, raw_msg: Option<&str>) -> EnrichedAnomalyEvent {
        EnrichedAnomalyEvent {
            anomaly: AnomalyEvent {
                schema_version: SCHEMA_VERSION,
                tracking_id: "T1".to_string(),
                timestamp: chrono::Utc::now(),
                ship_id: "alpha-ship".to_string(),
                device_id: "alpha-engine-02".to_string(),
                service: "engine-monitor".to_string(),
                domain: Domain::System,
                anomaly_type: "log_pattern".to_string(),
                metric_name: "log_anomaly".to_string(),
                metric_value: 1.0,
                threshold: 0.7,
                score,
                detector: "log_pattern_detector".to_string(),
                raw_msg: raw_msg.map(String::from),
                meta: Map::new(),
                extra: Map::new(),
            },
            enrichment_context: EnrichmentContext::default(),
            maritime_context: MaritimeContext {
                operational_status: status,
                route: None,
                location: None,
            },
            correlation_level: CorrelationLevel::Level1Enriched,
            context_sources: BTreeSet::new(),
            enhanced_score: None,
            risk_level: None,
            urgency: None,
            recommendations: Vec::new(),
            system_impact: None,
            grouping_analysis: None,
        }
    }

    #[test]
    fn critical_operations_boosts_score() {
        let analysis = rule_based_analysis(&enriched(0.6, OperationalStatus::CriticalOperations, None));
        assert!((analysis.enhanced_score - 0.78).abs() < 1e-9);
        assert_eq!(analysis.risk_level, Severity::High);
    }

    #[test]
    fn critical_keyword_boosts_score() {
        let analysis = rule_based_analysis(&enriched(
            0.85,
            OperationalStatus::Normal,
            Some("Engine coolant pump FAILED"),
        ));
        assert!(analysis.enhanced_score > 0.85);
        assert_eq!(analysis.risk_level, Severity::Critical);
        assert!(analysis
            .recommendations
            .contains(&"engine_diagnostics".to_string()));
    }

    #[test]
    fn score_is_clamped_to_one() {
        let analysis = rule_based_analysis(&enriched(
            0.95,
            OperationalStatus::CriticalOperations,
            Some("power bus safety fault"),
        ));
        assert!(analysis.enhanced_score <= 1.0);
        assert_eq!(analysis.urgency, "immediate");
        assert_eq!(analysis.system_impact, "system_wide");
    }

    #[test]
    fn low_score_recommends_monitoring() {
        let analysis = rule_based_analysis(&enriched(0.3, OperationalStatus::Normal, None));
        assert_eq!(analysis.risk_level, Severity::Low);
        assert!(analysis.recommendations.contains(&"monitor_closely".to_string()));
        assert_eq!(analysis.analysis_method, "rule_based_enhanced");
    }

    #[test]
    fn model_response_tokens_drive_risk() {
        let event = enriched(0.5, OperationalStatus::Normal, None);
        let analysis = parse_model_response("This looks CRITICAL, investigate now", &event);
        assert_eq!(analysis.risk_level, Severity::Critical);
        assert!((analysis.enhanced_score - 0.75).abs() < 1e-9);
        assert!(analysis
            .recommendations
            .contains(&"immediate_investigation".to_string()));
        assert_eq!(analysis.analysis_method, "model_enhanced");
    }
}
