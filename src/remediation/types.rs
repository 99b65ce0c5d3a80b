//! Remediation data model: actions, approvals, executions, policy decisions

use crate::types::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Playbook families the engine can run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionType {
    #[serde(rename = "failover_backup_satellite")]
    FailoverBackupSatellite,
    #[serde(rename = "qos_traffic_shaping")]
    QosTrafficShaping,
    #[serde(rename = "bandwidth_reduction")]
    BandwidthReduction,
    #[serde(rename = "antenna_realignment")]
    AntennaRealignment,
    #[serde(rename = "power_adjustment")]
    PowerAdjustment,
    #[serde(rename = "error_correction_increase")]
    ErrorCorrectionIncrease,
    #[serde(rename = "configuration_rollback")]
    ConfigurationRollback,
}

/// One catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action_id: String,
    pub action_type: ActionType,
    pub name: String,
    pub description: String,
    pub risk_level: Severity,
    pub requires_approval: bool,
    pub supports_dry_run: bool,
    pub supports_rollback: bool,
    /// Hard execution deadline in seconds; overruns mark the run failed
    pub max_execution_time_secs: u64,
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

/// Approval request for a high-risk action; expires after the approval TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: RemediationAction,
    pub trigger_incident_id: String,
    pub requesting_system: String,
    pub risk_assessment: Map<String, Value>,
    pub impact_analysis: Map<String, Value>,
    pub status: ApprovalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timestamp: Option<DateTime<Utc>>,
    pub expiry_time: DateTime<Utc>,
    pub justification: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    DryRun,
    Executing,
    Completed,
    Failed,
    RolledBack,
}

/// Execution record; `logs` is append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationExecution {
    pub execution_id: String,
    pub action_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub dry_run: bool,
    pub parameters: Map<String, Value>,
    pub results: Map<String, Value>,
    pub logs: Vec<String>,
    /// Snapshot captured at execute time, sufficient to revert the change.
    /// Absent for dry runs and for actions without rollback support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_data: Option<Map<String, Value>>,
    pub execution_time_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Outcome of policy evaluation. Denials and rate limits are decisions with
/// a reason, not errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub policy_name: String,
    pub requires_approval: bool,
    pub risk_assessment: Map<String, Value>,
    pub constraints: Map<String, Value>,
}

/// Link-health alert from the link monitor
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkAlert {
    #[serde(default)]
    pub alert_id: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub lead_time_minutes: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Built-in action catalog.
pub fn action_catalog() -> Vec<RemediationAction> {
    vec![
        RemediationAction {
            action_id: "satellite_failover".to_string(),
            action_type: ActionType::FailoverBackupSatellite,
            name: "Satellite Failover".to_string(),
            description: "Fail over the primary satellite link to the backup bird".to_string(),
            risk_level: Severity::High,
            requires_approval: true,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 300,
            parameters: params(&[("backup_satellite", Value::from("SAT-BACKUP-1"))]),
        },
        RemediationAction {
            action_id: "qos_shaping".to_string(),
            action_type: ActionType::QosTrafficShaping,
            name: "QoS Traffic Shaping".to_string(),
            description: "Prioritize critical traffic classes on the uplink".to_string(),
            risk_level: Severity::Medium,
            requires_approval: false,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 120,
            parameters: params(&[
                ("priority_classes", serde_json::json!(["critical", "high"])),
                ("bandwidth_limit_mbps", Value::from(10)),
            ]),
        },
        RemediationAction {
            action_id: "bandwidth_reduction".to_string(),
            action_type: ActionType::BandwidthReduction,
            name: "Bandwidth Reduction".to_string(),
            description: "Throttle non-essential traffic to protect the link".to_string(),
            risk_level: Severity::Medium,
            requires_approval: false,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 120,
            parameters: params(&[("reduction_percent", Value::from(25))]),
        },
        RemediationAction {
            action_id: "antenna_realignment".to_string(),
            action_type: ActionType::AntennaRealignment,
            name: "Antenna Realignment".to_string(),
            description: "Re-point the stabilized antenna to target elevation/azimuth".to_string(),
            risk_level: Severity::High,
            requires_approval: true,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 300,
            parameters: params(&[
                ("elevation_deg", Value::from(45)),
                ("azimuth_deg", Value::from(180)),
            ]),
        },
        RemediationAction {
            action_id: "power_adjustment".to_string(),
            action_type: ActionType::PowerAdjustment,
            name: "Transmit Power Adjustment".to_string(),
            description: "Step the BUC transmit power to compensate for fade".to_string(),
            risk_level: Severity::Medium,
            requires_approval: false,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 60,
            parameters: params(&[("power_adjustment_db", Value::from(2))]),
        },
        RemediationAction {
            action_id: "error_correction".to_string(),
            action_type: ActionType::ErrorCorrectionIncrease,
            name: "Error Correction Increase".to_string(),
            description: "Raise the FEC level to trade throughput for robustness".to_string(),
            risk_level: Severity::Low,
            requires_approval: false,
            supports_dry_run: true,
            supports_rollback: true,
            max_execution_time_secs: 60,
            parameters: params(&[("fec_level", Value::from("strong"))]),
        },
        RemediationAction {
            action_id: "config_rollback".to_string(),
            action_type: ActionType::ConfigurationRollback,
            name: "Configuration Rollback".to_string(),
            description: "Revert the modem to the last known-good configuration".to_string(),
            risk_level: Severity::High,
            requires_approval: true,
            supports_dry_run: true,
            supports_rollback: false,
            max_execution_time_secs: 180,
            parameters: params(&[("config_version", Value::from("last_known_good"))]),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_all_action_types() {
        let catalog = action_catalog();
        assert_eq!(catalog.len(), 7);
        let ids: Vec<&str> = catalog.iter().map(|a| a.action_id.as_str()).collect();
        assert!(ids.contains(&"satellite_failover"));
        assert!(ids.contains(&"qos_shaping"));
        assert!(ids.contains(&"config_rollback"));
    }

    #[test]
    fn high_risk_actions_require_approval() {
        for action in action_catalog() {
            if action.risk_level >= Severity::High {
                assert!(
                    action.requires_approval,
                    "{} is high risk but auto-approved",
                    action.action_id
                );
            }
        }
    }

    #[test]
    fn action_type_wire_names() {
        let json = serde_json::to_string(&ActionType::FailoverBackupSatellite).unwrap();
        assert_eq!(json, "\"failover_backup_satellite\"");
        let json = serde_json::to_string(&ActionType::ConfigurationRollback).unwrap();
        assert_eq!(json, "\"configuration_rollback\"");
    }
}
