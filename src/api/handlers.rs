//! API handlers
//!
//! Read paths go straight to the incident store; update paths go through the
//! writer so per-incident serialization holds; remediation paths delegate to
//! the engine. Health reads the per-component watch channels only.

use crate::health::HealthRegistry;
use crate::incident_store::{IncidentFilter, IncidentStoreClient};
use crate::remediation::RemediationEngine;
use crate::types::{
    new_tracking_id, Incident, IncidentStatus, Severity, TimelineEntry, SCHEMA_VERSION,
};
use crate::writer::WriterService;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

/// Shared state for every handler
#[derive(Clone)]
pub struct ApiState {
    pub health: HealthRegistry,
    pub store: IncidentStoreClient,
    pub writer: Arc<WriterService>,
    pub remediation: Arc<RemediationEngine>,
}

// ---------------------------------------------------------------------------
// Health & stats
// ---------------------------------------------------------------------------

pub async fn get_health(State(state): State<ApiState>) -> Json<Value> {
    let components = state.health.snapshot();
    Json(json!({
        "healthy": state.health.overall_healthy(),
        "components": components,
    }))
}

pub async fn get_component_health(
    State(state): State<ApiState>,
    Path(component): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .health
        .snapshot()
        .into_iter()
        .find(|report| report.component == component)
        .map(|report| Json(json!(report)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Processing stats derived from the detector's counters.
pub async fn get_stats(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.health.snapshot();
    let detector = snapshot.iter().find(|r| r.component == "detector");
    let processed = detector
        .and_then(|r| r.counters.get("logs_processed"))
        .copied()
        .unwrap_or(0);
    let published = detector
        .and_then(|r| r.counters.get("anomalies_published"))
        .copied()
        .unwrap_or(0);
    Json(json!({
        "events_processed": processed,
        "anomalies_detected": published,
        "detection_rate": published as f64 / (processed.max(1)) as f64,
    }))
}

// ---------------------------------------------------------------------------
// Incidents
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IncidentListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub ship_id: Option<String>,
}

pub async fn list_incidents(
    State(state): State<ApiState>,
    Query(query): Query<IncidentListQuery>,
) -> Result<Json<Vec<Incident>>, StatusCode> {
    let filter = IncidentFilter {
        status: query.status.as_deref().and_then(IncidentStatus::parse),
        ship_id: query.ship_id,
        limit: query.limit.unwrap_or(50),
    };
    state.store.list(&filter).await.map(Json).map_err(|e| {
        error!(error = %e, "Incident list failed");
        StatusCode::SERVICE_UNAVAILABLE
    })
}

pub async fn get_incident(
    State(state): State<ApiState>,
    Path(incident_id): Path<String>,
) -> Result<Json<Incident>, StatusCode> {
    match state.store.get(&incident_id).await {
        Ok(Some(incident)) => Ok(Json(incident)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(incident_id, error = %e, "Incident fetch failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TimelineEntryRequest {
    pub event: String,
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IncidentUpdateRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub acknowledged: Option<bool>,
    #[serde(default)]
    pub timeline_entry: Option<TimelineEntryRequest>,
}

pub async fn update_incident(
    State(state): State<ApiState>,
    Path(incident_id): Path<String>,
    Json(update): Json<IncidentUpdateRequest>,
) -> Result<Json<Incident>, StatusCode> {
    let status = match update.status.as_deref() {
        Some(raw) => Some(IncidentStatus::parse(raw).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    let timeline_entry = update.timeline_entry.map(|entry| {
        TimelineEntry::now(
            &entry.event,
            &entry.description,
            entry.source.as_deref().unwrap_or("api"),
        )
    });

    match state
        .writer
        .apply_update(&incident_id, status, update.acknowledged, timeline_entry)
        .await
    {
        Ok(Some(incident)) => Ok(Json(incident)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(incident_id, error = %e, "Incident update failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

pub async fn get_summary(State(state): State<ApiState>) -> Result<Json<Value>, StatusCode> {
    match state.store.summary().await {
        Ok(summary) => Ok(Json(json!({
            "total_incidents": summary.total_incidents,
            "open_incidents": summary.open_incidents,
            "critical_incidents": summary.critical_incidents,
            "recent_incidents": summary.recent_incidents,
        }))),
        Err(e) => {
            error!(error = %e, "Summary failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Seed a synthetic incident through the real storage path.
pub async fn create_test_incident(
    State(state): State<ApiState>,
) -> Result<Json<Incident>, StatusCode> {
    let tracking_id = new_tracking_id();
    let now = chrono::Utc::now();
    let incident = Incident {
        schema_version: SCHEMA_VERSION,
        incident_id: format!("inc-test-{}", uuid::Uuid::new_v4().simple()),
        correlation_id: format!("corr-test-{}", uuid::Uuid::new_v4().simple()),
        tracking_id,
        incident_type: "single_anomaly".to_string(),
        incident_severity: Severity::Medium,
        ship_id: "test-ship".to_string(),
        service: "test_service".to_string(),
        metric_name: "cpu_usage".to_string(),
        metric_value: 91.5,
        anomaly_score: 0.82,
        detector: "test_seed".to_string(),
        status: IncidentStatus::Open,
        acknowledged: false,
        created_at: now,
        updated_at: now,
        correlated_events: Vec::new(),
        timeline: vec![TimelineEntry::now(
            "incident_created",
            "seeded via POST /incidents/test",
            "api",
        )],
        suggested_runbooks: vec!["generic_investigation".to_string()],
        metadata: serde_json::Map::new(),
        extra: serde_json::Map::new(),
    };

    match state.store.insert(&incident).await {
        Ok(()) => Ok(Json(incident)),
        Err(e) => {
            error!(error = %e, "Test incident insert failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// Root-cause review for a stored incident.
pub async fn review_incident(
    State(state): State<ApiState>,
    Path(incident_id): Path<String>,
) -> Result<Json<crate::review::RootCauseAnalysis>, StatusCode> {
    match state.store.get(&incident_id).await {
        Ok(Some(incident)) => Ok(Json(crate::review::analyze(&incident))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(incident_id = %incident_id, error = %e, "Incident review fetch failed");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

// ---------------------------------------------------------------------------
// Remediation
// ---------------------------------------------------------------------------

pub async fn list_actions(State(state): State<ApiState>) -> Json<Value> {
    Json(json!(state.remediation.list_actions()))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteQuery {
    #[serde(default)]
    pub dry_run: Option<bool>,
}

pub async fn execute_action(
    State(state): State<ApiState>,
    Path(action_id): Path<String>,
    Query(query): Query<ExecuteQuery>,
) -> Result<Json<Value>, StatusCode> {
    let decision = state
        .remediation
        .evaluate_policy(&action_id)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    let execution = state
        .remediation
        .execute_action(&action_id, query.dry_run)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "execution": execution,
        "policy": decision,
    })))
}

pub async fn get_execution(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    state
        .remediation
        .execution(&execution_id)
        .map(|execution| Json(json!(execution)))
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn rollback_execution(
    State(state): State<ApiState>,
    Path(execution_id): Path<String>,
) -> Json<Value> {
    match state.remediation.rollback(&execution_id).await {
        Ok(execution) => Json(json!({
            "rollback_success": true,
            "execution_id": execution_id,
            "execution": execution,
        })),
        Err(reason) => Json(json!({
            "rollback_success": false,
            "execution_id": execution_id,
            "reason": reason,
        })),
    }
}

pub async fn list_approvals(State(state): State<ApiState>) -> Json<Value> {
    let approvals = state.remediation.approvals_snapshot();
    let pending = approvals
        .iter()
        .filter(|a| a.status == crate::remediation::types::ApprovalStatus::Pending)
        .count();
    Json(json!({
        "approvals": approvals,
        "pending_count": pending,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub resource: Option<String>,
}

/// Remediation audit trail, oldest first.
pub async fn get_audit_trail(
    State(state): State<ApiState>,
    Query(query): Query<AuditQuery>,
) -> Json<Value> {
    let trail = state.remediation.audit_trail(query.resource.as_deref());
    Json(json!({
        "count": trail.len(),
        "entries": trail,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ApproveQuery {
    pub approver: Option<String>,
}

pub async fn approve_request(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
    Query(query): Query<ApproveQuery>,
) -> Result<Json<Value>, StatusCode> {
    let approver = query.approver.ok_or(StatusCode::BAD_REQUEST)?;
    match state.remediation.approve(&request_id, &approver).await {
        Ok((request, execution)) => Ok(Json(json!({
            "approval_status": "approved",
            "request": request,
            "execution_id": execution.execution_id,
            "execution": execution,
        }))),
        Err(reason) if reason.contains("not found") => Err(StatusCode::NOT_FOUND),
        Err(reason) => Ok(Json(json!({
            "approval_status": "rejected",
            "reason": reason,
        }))),
    }
}
