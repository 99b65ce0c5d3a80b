//! API route definitions
//!
//! Endpoints:
//! - /health, /health/:component, /stats — component status
//! - /incidents, /incidents/:id, /summary — incident store surface
//! - /actions, /execute/:id, /executions/:id, /rollback/:id,
//!   /approvals, /approve/:id — remediation surface

use axum::routing::{get, post, put};
use axum::Router;

use super::handlers::{self, ApiState};

/// Build the route table.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::get_health))
        .route("/health/:component", get(handlers::get_component_health))
        .route("/stats", get(handlers::get_stats))
        // Incidents
        .route("/incidents", get(handlers::list_incidents))
        .route("/incidents/test", post(handlers::create_test_incident))
        .route("/incidents/:id", get(handlers::get_incident))
        .route("/incidents/:id", put(handlers::update_incident))
        .route("/incidents/:id/review", get(handlers::review_incident))
        .route("/summary", get(handlers::get_summary))
        // Remediation
        .route("/actions", get(handlers::list_actions))
        .route("/execute/:action_id", post(handlers::execute_action))
        .route("/executions/:id", get(handlers::get_execution))
        .route("/rollback/:id", post(handlers::rollback_execution))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approve/:request_id", post(handlers::approve_request))
        .route("/audit", get(handlers::get_audit_trail))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusGateway;
    use crate::incident_store::IncidentStoreClient;
    use crate::registry::DeviceRegistryClient;
    use crate::remediation::RemediationEngine;
    use crate::types::OperationalSnapshot;
    use crate::writer::WriterService;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        crate::config::init_for_tests();
        let client = async_nats::ConnectOptions::new()
            .retry_on_initial_connect()
            .connect("nats://127.0.0.1:1")
            .await
            .unwrap();
        let bus = BusGateway::from_client(client);
        let store = IncidentStoreClient::new(
            clickhouse::Client::default().with_url("http://127.0.0.1:1"),
        );
        let registry = Arc::new(DeviceRegistryClient::new(
            "http://127.0.0.1:1",
            Duration::from_secs(300),
            Duration::from_millis(50),
        ));
        let mut health = crate::health::HealthRegistry::default();
        let writer = Arc::new(WriterService::new(
            bus.clone(),
            store.clone(),
            registry,
            health.register("incident_writer"),
        ));
        let (_ops_tx, ops_rx) = tokio::sync::watch::channel(OperationalSnapshot::default());
        let remediation = Arc::new(RemediationEngine::new(
            bus,
            ops_rx,
            health.register("remediation"),
        ));
        ApiState {
            health,
            store,
            writer,
            remediation,
        }
    }

    #[tokio::test]
    async fn health_route_responds() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn actions_route_lists_catalog() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/actions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let actions: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(actions.as_array().map(Vec::len), Some(7));
    }

    #[tokio::test]
    async fn execute_dry_run_completes_with_policy_decision() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/execute/qos_shaping?dry_run=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["execution"]["status"], "completed");
        assert_eq!(payload["execution"]["dry_run"], true);
        assert!(payload["execution"]["rollback_data"].is_null());
        assert_eq!(payload["policy"]["allowed"], true);
        assert_eq!(payload["policy"]["requires_approval"], false);
    }

    #[tokio::test]
    async fn execute_unknown_action_is_404() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/execute/nonsense")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn approve_without_approver_is_400() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/approve/approval-x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn approvals_route_lists_statuses() {
        let app = api_routes(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/approvals").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["pending_count"], 0);
    }
}
