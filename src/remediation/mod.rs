//! Remediation Engine — guarded auto-remediation
//!
//! Triggers on correlated incidents and link-health alerts. Each trigger
//! walks the decision pipeline: select an action, evaluate policy (external
//! engine with built-in fallback), then either drop (denied), request
//! approval (30-minute expiry, swept every 30 s), or execute. Executions run
//! dry unless the policy explicitly grants direct execution; approved
//! requests execute for real.

pub mod audit;
pub mod executor;
pub mod policy;
pub mod types;

use crate::bus::{decode_payload, topics, BusGateway, DedupCache};
use crate::config;
use crate::config::defaults::{APPROVAL_SWEEP_SECS, HEALTH_CHECK_SECS};
use crate::health::HealthReporter;
use crate::types::{Incident, OperationalSnapshot, Severity};
use dashmap::DashMap;
use executor::PlaybookExecutor;
use futures::StreamExt;
use policy::{PolicyContext, PolicyEngine};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use types::{
    action_catalog, ApprovalRequest, ApprovalStatus, LinkAlert, RemediationAction,
    RemediationExecution,
};

#[derive(Default)]
struct Counters {
    incidents_consumed: AtomicU64,
    alerts_consumed: AtomicU64,
    actions_executed: AtomicU64,
    approvals_created: AtomicU64,
    approvals_expired: AtomicU64,
    policy_denied: AtomicU64,
    parse_errors: AtomicU64,
}

pub struct RemediationEngine {
    bus: BusGateway,
    policy: PolicyEngine,
    executor: PlaybookExecutor,
    actions: BTreeMap<String, RemediationAction>,
    approvals: DashMap<String, ApprovalRequest>,
    audit: audit::AuditLog,
    dedup: DedupCache,
    ops: watch::Receiver<OperationalSnapshot>,
    health: HealthReporter,
    counters: Counters,
}

impl RemediationEngine {
    pub fn new(
        bus: BusGateway,
        ops: watch::Receiver<OperationalSnapshot>,
        health: HealthReporter,
    ) -> Self {
        let endpoints = &config::get().endpoints;
        let actions = action_catalog()
            .into_iter()
            .map(|a| (a.action_id.clone(), a))
            .collect();
        Self {
            bus,
            policy: PolicyEngine::new(&endpoints.policy_engine_url, &endpoints.policy_namespace),
            executor: PlaybookExecutor::new(),
            actions,
            approvals: DashMap::new(),
            audit: audit::AuditLog::new(),
            dedup: DedupCache::default(),
            ops,
            health,
            counters: Counters::default(),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(actions = self.actions.len(), "Remediation engine started");
        let incidents = tokio::spawn(self.clone().incident_worker(cancel.clone()));
        let alerts = tokio::spawn(self.clone().alert_worker(cancel.clone()));
        let sweeper = tokio::spawn(self.clone().expiry_sweeper(cancel.clone()));
        let health = tokio::spawn(self.clone().health_loop(cancel));
        let _ = tokio::join!(incidents, alerts, sweeper, health);
        info!("Remediation engine stopped");
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    async fn incident_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) =
            crate::bus::subscribe_with_retry(&self.bus, topics::INCIDENTS_CREATED, &cancel)
                .await
        else {
            return;
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_incident(&message.payload).await;
                }
            }
        }
    }

    async fn alert_worker(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) =
            crate::bus::subscribe_with_retry(&self.bus, topics::LINK_HEALTH_ALERT, &cancel)
                .await
        else {
            return;
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                message = subscriber.next() => {
                    let Some(message) = message else { break };
                    self.handle_alert(&message.payload).await;
                }
            }
        }
    }

    async fn handle_incident(&self, payload: &[u8]) {
        let incident = match decode_payload::<Incident>(topics::INCIDENTS_CREATED, payload) {
            Ok(incident) => incident,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if !self
            .dedup
            .first_delivery(topics::INCIDENTS_CREATED, &incident.incident_id)
        {
            return;
        }
        self.counters.incidents_consumed.fetch_add(1, Ordering::Relaxed);

        let risk_factors = incident_risk_factors(&incident, &self.ops.borrow());
        let trigger = serde_json::to_value(&incident).unwrap_or(Value::Null);
        self.decide(
            incident.incident_severity,
            &risk_factors,
            &incident.incident_id,
            trigger,
        )
        .await;
    }

    async fn handle_alert(&self, payload: &[u8]) {
        let alert = match decode_payload::<LinkAlert>(topics::LINK_HEALTH_ALERT, payload) {
            Ok(alert) => alert,
            Err(_) => {
                self.counters.parse_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        // Alerts arriving without an id still need redelivery protection:
        // executing satellite_failover twice because the monitor omitted an
        // id is worse than occasionally collapsing two identical alerts.
        let alert_key = if alert.alert_id.is_empty() {
            synthetic_alert_id(&alert, chrono::Utc::now().timestamp() / 60)
        } else {
            alert.alert_id.clone()
        };
        if !self
            .dedup
            .first_delivery(topics::LINK_HEALTH_ALERT, &alert_key)
        {
            return;
        }
        self.counters.alerts_consumed.fetch_add(1, Ordering::Relaxed);
        info!(
            severity = %alert.severity,
            lead_time_min = alert.lead_time_minutes,
            "Link health alert received"
        );

        let severity = Severity::parse_lenient(&alert.severity);
        let trigger = serde_json::to_value(&alert).unwrap_or(Value::Null);
        self.decide(severity, &alert.risk_factors, &alert_key, trigger)
            .await;
    }

    // ------------------------------------------------------------------
    // Decision pipeline
    // ------------------------------------------------------------------

    async fn decide(
        &self,
        severity: Severity,
        risk_factors: &[String],
        trigger_id: &str,
        trigger: Value,
    ) {
        let Some(action_id) = select_action(severity, risk_factors) else {
            info!(trigger_id, "No suitable remediation action for trigger");
            return;
        };
        let Some(action) = self.actions.get(action_id).cloned() else {
            warn!(action_id, "Selected action missing from catalog");
            return;
        };

        let window = Duration::from_secs(config::get().remediation.rate_limit_window_seconds);
        let context = PolicyContext {
            recent_attempts: self.executor.recent_attempts(&action.action_id, window),
            rain_rate_mm_h: self.ops.borrow().weather.rain_rate_mm_h,
            trigger,
        };

        let decision = self.policy.evaluate(&action, &context).await;
        let mut audit_details = Map::new();
        audit_details.insert("trigger_id".to_string(), Value::from(trigger_id));
        audit_details.insert("policy".to_string(), Value::from(decision.policy_name.clone()));
        audit_details.insert("reason".to_string(), Value::from(decision.reason.clone()));
        self.audit.record(
            "policy_engine",
            "policy_decision",
            &action.action_id,
            if decision.allowed { "allowed" } else { "denied" },
            audit_details,
        );
        if !decision.allowed {
            self.counters.policy_denied.fetch_add(1, Ordering::Relaxed);
            info!(
                action_id = %action.action_id,
                trigger_id,
                reason = %decision.reason,
                "Action not allowed by policy"
            );
            return;
        }

        if decision.requires_approval {
            self.create_approval_request(&action, trigger_id, &decision)
                .await;
            return;
        }

        // Dry-run first unless the policy explicitly grants direct execution.
        let direct = decision
            .constraints
            .get("direct_execute")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let execution = self.executor.execute(&action, !direct, None).await;
        self.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
        self.record_execution_audit("remediation_engine", &execution);
        info!(
            action_id = %action.action_id,
            execution_id = %execution.execution_id,
            dry_run = execution.dry_run,
            status = ?execution.status,
            "Auto-executed remediation"
        );
    }

    fn record_execution_audit(&self, actor: &str, execution: &RemediationExecution) {
        let mut details = Map::new();
        details.insert("action_id".to_string(), Value::from(execution.action_id.clone()));
        details.insert("dry_run".to_string(), Value::from(execution.dry_run));
        self.audit.record(
            actor,
            "execution",
            &execution.execution_id,
            match execution.status {
                types::ExecutionStatus::Completed => "completed",
                types::ExecutionStatus::Failed => "failed",
                _ => "in_progress",
            },
            details,
        );
    }

    async fn create_approval_request(
        &self,
        action: &RemediationAction,
        trigger_id: &str,
        decision: &types::PolicyDecision,
    ) {
        let ttl = config::get().remediation.approval_ttl_seconds;
        let request = ApprovalRequest {
            request_id: format!("approval-{}", uuid::Uuid::new_v4().simple()),
            timestamp: chrono::Utc::now(),
            action: action.clone(),
            trigger_incident_id: trigger_id.to_string(),
            requesting_system: "remediation_engine".to_string(),
            risk_assessment: decision.risk_assessment.clone(),
            impact_analysis: impact_analysis(action),
            status: ApprovalStatus::Pending,
            approver: None,
            approval_timestamp: None,
            expiry_time: chrono::Utc::now() + chrono::Duration::seconds(ttl as i64),
            justification: format!(
                "Automatic remediation for {} trigger {trigger_id}",
                action.risk_level
            ),
        };

        self.approvals
            .insert(request.request_id.clone(), request.clone());
        self.counters.approvals_created.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self
            .bus
            .publish_json(topics::REMEDIATION_APPROVAL_REQUEST, &request)
            .await
        {
            warn!(request_id = %request.request_id, error = %e, "Approval request publish dropped");
        }
        info!(
            request_id = %request.request_id,
            action_id = %action.action_id,
            expires = %request.expiry_time,
            "Approval requested"
        );
    }

    /// Approve a pending request and execute the action for real.
    pub async fn approve(
        &self,
        request_id: &str,
        approver: &str,
    ) -> Result<(ApprovalRequest, RemediationExecution), String> {
        let mut request = self
            .approvals
            .get_mut(request_id)
            .ok_or_else(|| format!("Approval request not found: {request_id}"))?;

        match request.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => return Err("Approval request has expired".to_string()),
            _ => return Err(format!("Approval request is already {:?}", request.status)),
        }

        request.status = ApprovalStatus::Approved;
        request.approver = Some(approver.to_string());
        request.approval_timestamp = Some(chrono::Utc::now());
        let approved = request.clone();
        drop(request);

        let mut details = Map::new();
        details.insert(
            "action_id".to_string(),
            Value::from(approved.action.action_id.clone()),
        );
        self.audit
            .record(approver, "approval", request_id, "approved", details);

        let execution = self.executor.execute(&approved.action, false, None).await;
        self.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
        self.record_execution_audit(approver, &execution);
        info!(
            request_id,
            approver,
            execution_id = %execution.execution_id,
            "Approved action executed"
        );
        Ok((approved, execution))
    }

    // ------------------------------------------------------------------
    // Background fibers
    // ------------------------------------------------------------------

    async fn expiry_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(APPROVAL_SWEEP_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.sweep_expired(),
            }
        }
    }

    fn sweep_expired(&self) {
        let now = chrono::Utc::now();
        let mut expired = 0_u64;
        for mut entry in self.approvals.iter_mut() {
            if entry.status == ApprovalStatus::Pending && now > entry.expiry_time {
                entry.status = ApprovalStatus::Expired;
                self.audit.record(
                    "expiry_sweeper",
                    "approval",
                    &entry.request_id,
                    "expired",
                    Map::new(),
                );
                expired += 1;
            }
        }
        if expired > 0 {
            self.counters.approvals_expired.fetch_add(expired, Ordering::Relaxed);
            info!(expired, "Expired overdue approval requests");
        }
    }

    async fn health_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(HEALTH_CHECK_SECS));
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let mut deps = BTreeMap::new();
                    deps.insert("nats".to_string(), self.bus.is_connected());
                    deps.insert("policy_engine".to_string(), self.policy.health_check().await);
                    let mut counters = BTreeMap::new();
                    counters.insert("incidents_consumed".to_string(), self.counters.incidents_consumed.load(Ordering::Relaxed));
                    counters.insert("alerts_consumed".to_string(), self.counters.alerts_consumed.load(Ordering::Relaxed));
                    counters.insert("actions_executed".to_string(), self.counters.actions_executed.load(Ordering::Relaxed));
                    counters.insert("approvals_created".to_string(), self.counters.approvals_created.load(Ordering::Relaxed));
                    counters.insert("approvals_expired".to_string(), self.counters.approvals_expired.load(Ordering::Relaxed));
                    counters.insert("policy_denied".to_string(), self.counters.policy_denied.load(Ordering::Relaxed));
                    counters.insert("pending_approvals".to_string(),
                        self.approvals.iter().filter(|a| a.status == ApprovalStatus::Pending).count() as u64);
                    self.health.report(deps, counters);
                    self.dedup.sweep();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // API surface
    // ------------------------------------------------------------------

    pub fn list_actions(&self) -> Vec<RemediationAction> {
        self.actions.values().cloned().collect()
    }

    pub fn action(&self, action_id: &str) -> Option<RemediationAction> {
        self.actions.get(action_id).cloned()
    }

    /// Manual execution via the API. Honors the configured dry-run default.
    pub async fn execute_action(
        &self,
        action_id: &str,
        dry_run: Option<bool>,
    ) -> Option<RemediationExecution> {
        let action = self.actions.get(action_id)?.clone();
        let dry_run = dry_run.unwrap_or(config::get().remediation.dry_run_default);
        let execution = self.executor.execute(&action, dry_run, None).await;
        self.counters.actions_executed.fetch_add(1, Ordering::Relaxed);
        self.record_execution_audit("api", &execution);
        Some(execution)
    }

    /// Policy decision preview for manual executions (API response detail).
    pub async fn evaluate_policy(&self, action_id: &str) -> Option<types::PolicyDecision> {
        let action = self.actions.get(action_id)?.clone();
        let window = Duration::from_secs(config::get().remediation.rate_limit_window_seconds);
        let context = PolicyContext {
            recent_attempts: self.executor.recent_attempts(action_id, window),
            rain_rate_mm_h: self.ops.borrow().weather.rain_rate_mm_h,
            trigger: Value::Null,
        };
        Some(self.policy.evaluate(&action, &context).await)
    }

    pub fn execution(&self, execution_id: &str) -> Option<RemediationExecution> {
        self.executor.get(execution_id)
    }

    pub async fn rollback(&self, execution_id: &str) -> Result<RemediationExecution, String> {
        let result = self.executor.rollback(execution_id).await;
        self.audit.record(
            "api",
            "rollback",
            execution_id,
            if result.is_ok() { "rolled_back" } else { "rejected" },
            Map::new(),
        );
        result
    }

    /// Audit trail, optionally filtered by resource id.
    pub fn audit_trail(&self, resource: Option<&str>) -> Vec<audit::AuditEntry> {
        self.audit.trail(resource)
    }

    /// All approval requests with their current status (pending, approved,
    /// expired, …).
    pub fn approvals_snapshot(&self) -> Vec<ApprovalRequest> {
        self.approvals.iter().map(|a| a.clone()).collect()
    }

    #[cfg(test)]
    fn insert_approval(&self, request: ApprovalRequest) {
        self.approvals.insert(request.request_id.clone(), request);
    }
}

/// Map a trigger onto the action catalog.
///
/// Link-integrity factors dominate: SNR/BER trouble fails over on critical
/// severity and shapes traffic otherwise; heavy precipitation reduces
/// bandwidth; anything high/critical gets QoS shaping; the default is the
/// conservative bandwidth reduction.
pub fn select_action(severity: Severity, risk_factors: &[String]) -> Option<&'static str> {
    let has = |needle: &str| risk_factors.iter().any(|f| f == needle);

    if has("Low SNR") || has("High BER") {
        return Some(if severity == Severity::Critical {
            "satellite_failover"
        } else {
            "qos_shaping"
        });
    }
    if has("Heavy precipitation") {
        return Some("bandwidth_reduction");
    }
    if severity >= Severity::High {
        return Some("qos_shaping");
    }
    Some("bandwidth_reduction")
}

/// Stable stand-in id for alerts that arrive without one.
///
/// Hashes the alert content together with a one-minute time bucket, so bus
/// redeliveries of the same message collapse onto one key while a genuinely
/// new alert with the same shape passes once the bucket rolls over.
fn synthetic_alert_id(alert: &LinkAlert, time_bucket: i64) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    alert.severity.hash(&mut hasher);
    for factor in &alert.risk_factors {
        factor.hash(&mut hasher);
    }
    time_bucket.hash(&mut hasher);
    format!("link-alert-{:016x}", hasher.finish())
}

/// Derive link-style risk factors from an incident's shape.
fn incident_risk_factors(incident: &Incident, snapshot: &OperationalSnapshot) -> Vec<String> {
    let mut factors = Vec::new();
    let metric = incident.metric_name.to_lowercase();
    if metric.contains("satellite_snr") {
        factors.push("Low SNR".to_string());
    }
    if metric.contains("satellite_ber") {
        factors.push("High BER".to_string());
    }
    if snapshot.weather.rain_rate_mm_h > 5.0 {
        factors.push("Heavy precipitation".to_string());
    }
    factors
}

fn impact_analysis(action: &RemediationAction) -> Map<String, Value> {
    let mut impact = Map::new();
    impact.insert(
        "estimated_downtime".to_string(),
        Value::from(match action.action_type {
            types::ActionType::FailoverBackupSatellite => "30 seconds",
            types::ActionType::AntennaRealignment => "60 seconds",
            _ => "none",
        }),
    );
    impact.insert(
        "affected_systems".to_string(),
        serde_json::json!(["satellite_link"]),
    );
    impact
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_alert_id_is_stable_per_content() {
        let alert = LinkAlert {
            severity: "CRITICAL".to_string(),
            risk_factors: vec!["Low SNR".to_string()],
            ..LinkAlert::default()
        };
        // A redelivery inside the same time bucket maps to the same key
        assert_eq!(synthetic_alert_id(&alert, 100), synthetic_alert_id(&alert, 100));

        // Different content or a later bucket yields a fresh key
        let other = LinkAlert {
            severity: "CRITICAL".to_string(),
            risk_factors: vec!["Heavy precipitation".to_string()],
            ..LinkAlert::default()
        };
        assert_ne!(synthetic_alert_id(&alert, 100), synthetic_alert_id(&other, 100));
        assert_ne!(synthetic_alert_id(&alert, 100), synthetic_alert_id(&alert, 101));
    }

    #[test]
    fn select_action_rules() {
        let low_snr = vec!["Low SNR".to_string()];
        assert_eq!(
            select_action(Severity::Critical, &low_snr),
            Some("satellite_failover")
        );
        assert_eq!(select_action(Severity::High, &low_snr), Some("qos_shaping"));

        let rain = vec!["Heavy precipitation".to_string()];
        assert_eq!(select_action(Severity::Medium, &rain), Some("bandwidth_reduction"));

        assert_eq!(select_action(Severity::Critical, &[]), Some("qos_shaping"));
        assert_eq!(select_action(Severity::Low, &[]), Some("bandwidth_reduction"));
    }

    #[tokio::test]
    async fn approval_expiry_and_rejection_of_expired() {
        crate::config::init_for_tests();
        let (_, ops_rx) = watch::channel(OperationalSnapshot::default());
        let engine = RemediationEngine::new(
            BusGateway::from_client(test_client().await),
            ops_rx,
            crate::health::HealthRegistry::default().register("remediation"),
        );

        let action = action_catalog()
            .into_iter()
            .find(|a| a.action_id == "satellite_failover")
            .unwrap();
        let request = ApprovalRequest {
            request_id: "approval-1".to_string(),
            timestamp: chrono::Utc::now() - chrono::Duration::minutes(40),
            action,
            trigger_incident_id: "inc-T1".to_string(),
            requesting_system: "remediation_engine".to_string(),
            risk_assessment: Map::new(),
            impact_analysis: Map::new(),
            status: ApprovalStatus::Pending,
            approver: None,
            approval_timestamp: None,
            expiry_time: chrono::Utc::now() - chrono::Duration::minutes(10),
            justification: "test".to_string(),
        };
        engine.insert_approval(request);

        engine.sweep_expired();
        let approvals = engine.approvals_snapshot();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].status, ApprovalStatus::Expired);

        // An expired request can no longer be actioned
        let err = engine.approve("approval-1", "chief-engineer").await.unwrap_err();
        assert!(err.contains("expired"));
        // And nothing was executed
        assert!(engine.executor.executions_snapshot().is_empty());
    }

    #[tokio::test]
    async fn approve_executes_for_real() {
        crate::config::init_for_tests();
        let (_, ops_rx) = watch::channel(OperationalSnapshot::default());
        let engine = RemediationEngine::new(
            BusGateway::from_client(test_client().await),
            ops_rx,
            crate::health::HealthRegistry::default().register("remediation"),
        );

        let action = action_catalog()
            .into_iter()
            .find(|a| a.action_id == "qos_shaping")
            .unwrap();
        engine.insert_approval(ApprovalRequest {
            request_id: "approval-2".to_string(),
            timestamp: chrono::Utc::now(),
            action,
            trigger_incident_id: "inc-T2".to_string(),
            requesting_system: "remediation_engine".to_string(),
            risk_assessment: Map::new(),
            impact_analysis: Map::new(),
            status: ApprovalStatus::Pending,
            approver: None,
            approval_timestamp: None,
            expiry_time: chrono::Utc::now() + chrono::Duration::minutes(30),
            justification: "test".to_string(),
        });

        let (approved, execution) = engine.approve("approval-2", "master").await.unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.approver.as_deref(), Some("master"));
        assert!(!execution.dry_run);
        assert!(execution.rollback_data.is_some());
    }

    #[allow(clippy::unwrap_used)]
    async fn test_client() -> async_nats::Client {
        async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap()
    }
}
