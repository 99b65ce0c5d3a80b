//! Policy evaluation: external engine first, built-in rules as fallback
//!
//! The external policy engine gets a 5 s deadline; on any failure the
//! built-in per-action policies decide. Both paths produce a
//! [`PolicyDecision`] — denial is a decision with a reason, never an error.

use super::types::{PolicyDecision, RemediationAction};
use crate::types::Severity;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Built-in policy for one action id
#[derive(Debug, Clone)]
struct BuiltinPolicy {
    max_per_hour: u64,
    requires_approval: bool,
    allowed_risk_levels: &'static [Severity],
    max_reduction_percent: Option<u64>,
    business_hours_only: bool,
    weather_check: bool,
}

/// Facts the policy needs about the current situation
#[derive(Debug, Clone, Default)]
pub struct PolicyContext {
    /// Executions of this action type within the rate-limit window, any state
    pub recent_attempts: u64,
    pub rain_rate_mm_h: f64,
    /// The triggering alert/incident, passed through to the external engine
    pub trigger: Value,
}

pub struct PolicyEngine {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    builtin: BTreeMap<&'static str, BuiltinPolicy>,
}

impl PolicyEngine {
    pub fn new(base_url: &str, namespace: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            builtin: builtin_policies(),
        }
    }

    /// Evaluate an action. Tries the external engine, falls back to the
    /// built-in rules on unavailability.
    pub async fn evaluate(
        &self,
        action: &RemediationAction,
        context: &PolicyContext,
    ) -> PolicyDecision {
        if !self.base_url.is_empty() {
            match self.evaluate_external(action, context).await {
                Ok(decision) => return decision,
                Err(e) => {
                    warn!(error = %e, "Policy engine unavailable — using built-in policies");
                }
            }
        }
        self.evaluate_builtin(action, context)
    }

    async fn evaluate_external(
        &self,
        action: &RemediationAction,
        context: &PolicyContext,
    ) -> Result<PolicyDecision, reqwest::Error> {
        let input = serde_json::json!({
            "input": {
                "action": action,
                "context": {
                    "recent_actions_count": context.recent_attempts,
                    "rain_rate_mm_h": context.rain_rate_mm_h,
                    "trigger": context.trigger,
                },
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        });

        let response = self
            .http
            .post(format!(
                "{}/v1/data/{}/allow",
                self.base_url, self.namespace
            ))
            .json(&input)
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let result = body.get("result").cloned().unwrap_or(Value::Null);

        Ok(PolicyDecision {
            allowed: result.get("allowed").and_then(Value::as_bool).unwrap_or(false),
            reason: result
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("Policy evaluation failed")
                .to_string(),
            policy_name: result
                .get("policy")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            requires_approval: result
                .get("requires_approval")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            risk_assessment: result
                .get("risk_assessment")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            constraints: result
                .get("constraints")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn evaluate_builtin(
        &self,
        action: &RemediationAction,
        context: &PolicyContext,
    ) -> PolicyDecision {
        let policy = self
            .builtin
            .get(action.action_id.as_str())
            .unwrap_or_else(|| &self.builtin["qos_shaping"]);

        let mut allowed = true;
        let mut reason = "Policy evaluation passed".to_string();

        if !policy.allowed_risk_levels.contains(&action.risk_level) {
            allowed = false;
            reason = format!("Risk level {} not allowed", action.risk_level);
        }

        if allowed && context.recent_attempts >= policy.max_per_hour {
            allowed = false;
            reason = format!(
                "Rate limit exceeded: {}/{} per hour",
                context.recent_attempts, policy.max_per_hour
            );
        }

        if allowed && policy.business_hours_only && !is_business_hours() {
            allowed = false;
            reason = "Action restricted to business hours".to_string();
        }

        if allowed && policy.weather_check && context.rain_rate_mm_h > 5.0 {
            allowed = false;
            reason = format!(
                "Weather check failed: rain rate {:.1} mm/h",
                context.rain_rate_mm_h
            );
        }

        let mut constraints = Map::new();
        constraints.insert("max_per_hour".to_string(), Value::from(policy.max_per_hour));
        if let Some(max_reduction) = policy.max_reduction_percent {
            constraints.insert(
                "max_reduction_percent".to_string(),
                Value::from(max_reduction),
            );
        }

        let mut risk_assessment = Map::new();
        risk_assessment.insert(
            "risk_level".to_string(),
            Value::from(action.risk_level.as_str()),
        );

        debug!(
            action_id = %action.action_id,
            allowed,
            reason = %reason,
            "Built-in policy decision"
        );

        PolicyDecision {
            allowed,
            reason,
            policy_name: format!("builtin_{}", action.action_id),
            requires_approval: policy.requires_approval,
            risk_assessment,
            constraints,
        }
    }

    /// Probe the external engine's health endpoint.
    pub async fn health_check(&self) -> bool {
        if self.base_url.is_empty() {
            return false;
        }
        let url = format!("{}/health", self.base_url);
        match self
            .http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(r) => r.status().is_success(),
            Err(_) => false,
        }
    }
}

fn is_business_hours() -> bool {
    use chrono::Timelike;
    let hour = chrono::Utc::now().hour();
    (8..18).contains(&hour)
}

fn builtin_policies() -> BTreeMap<&'static str, BuiltinPolicy> {
    let mut policies = BTreeMap::new();
    policies.insert(
        "satellite_failover",
        BuiltinPolicy {
            max_per_hour: 2,
            requires_approval: true,
            allowed_risk_levels: &[Severity::High, Severity::Critical],
            max_reduction_percent: None,
            business_hours_only: false,
            weather_check: false,
        },
    );
    policies.insert(
        "qos_shaping",
        BuiltinPolicy {
            max_per_hour: 5,
            requires_approval: false,
            allowed_risk_levels: &[
                Severity::Low,
                Severity::Medium,
                Severity::High,
                Severity::Critical,
            ],
            max_reduction_percent: Some(50),
            business_hours_only: false,
            weather_check: false,
        },
    );
    policies.insert(
        "bandwidth_reduction",
        BuiltinPolicy {
            max_per_hour: 10,
            requires_approval: false,
            allowed_risk_levels: &[Severity::Medium, Severity::High, Severity::Critical],
            max_reduction_percent: Some(30),
            business_hours_only: false,
            weather_check: false,
        },
    );
    policies.insert(
        "antenna_realignment",
        BuiltinPolicy {
            max_per_hour: 3,
            requires_approval: true,
            allowed_risk_levels: &[Severity::High, Severity::Critical],
            max_reduction_percent: None,
            business_hours_only: false,
            weather_check: true,
        },
    );
    policies.insert(
        "power_adjustment",
        BuiltinPolicy {
            max_per_hour: 6,
            requires_approval: false,
            allowed_risk_levels: &[Severity::Low, Severity::Medium, Severity::High],
            max_reduction_percent: None,
            business_hours_only: false,
            weather_check: false,
        },
    );
    policies.insert(
        "error_correction",
        BuiltinPolicy {
            max_per_hour: 10,
            requires_approval: false,
            allowed_risk_levels: &[
                Severity::Low,
                Severity::Medium,
                Severity::High,
                Severity::Critical,
            ],
            max_reduction_percent: None,
            business_hours_only: false,
            weather_check: false,
        },
    );
    policies.insert(
        "config_rollback",
        BuiltinPolicy {
            max_per_hour: 2,
            requires_approval: true,
            allowed_risk_levels: &[Severity::High, Severity::Critical],
            max_reduction_percent: None,
            business_hours_only: true,
            weather_check: false,
        },
    );
    policies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::types::action_catalog;

    fn engine() -> PolicyEngine {
        // Empty base url: built-in policies only
        PolicyEngine::new("", "remediation")
    }

    fn action(action_id: &str) -> RemediationAction {
        action_catalog()
            .into_iter()
            .find(|a| a.action_id == action_id)
            .unwrap()
    }

    #[tokio::test]
    async fn qos_shaping_auto_approved() {
        let decision = engine()
            .evaluate(&action("qos_shaping"), &PolicyContext::default())
            .await;
        assert!(decision.allowed);
        assert!(!decision.requires_approval);
        assert_eq!(decision.policy_name, "builtin_qos_shaping");
    }

    #[tokio::test]
    async fn satellite_failover_needs_approval() {
        let decision = engine()
            .evaluate(&action("satellite_failover"), &PolicyContext::default())
            .await;
        assert!(decision.allowed);
        assert!(decision.requires_approval);
    }

    #[tokio::test]
    async fn rate_limit_denies_with_reason() {
        let context = PolicyContext {
            recent_attempts: 5,
            ..PolicyContext::default()
        };
        let decision = engine().evaluate(&action("qos_shaping"), &context).await;
        assert!(!decision.allowed);
        assert!(decision.reason.contains("Rate limit exceeded"));
    }

    #[tokio::test]
    async fn antenna_realignment_blocked_in_heavy_rain() {
        let context = PolicyContext {
            rain_rate_mm_h: 9.0,
            ..PolicyContext::default()
        };
        let decision = engine()
            .evaluate(&action("antenna_realignment"), &context)
            .await;
        assert!(!decision.allowed);
        assert!(decision.reason.contains("Weather check failed"));
    }

    #[tokio::test]
    async fn constraints_carry_reduction_cap() {
        let decision = engine()
            .evaluate(&action("bandwidth_reduction"), &PolicyContext::default())
            .await;
        assert_eq!(
            decision.constraints.get("max_reduction_percent"),
            Some(&Value::from(30_u64))
        );
    }
}
