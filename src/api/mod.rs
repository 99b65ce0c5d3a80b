//! HTTP API for health, incidents, and remediation control
//!
//! One axum application serves every component surface: aggregate and
//! per-component health, the incident read/update API backed by the columnar
//! store, and the remediation action/approval endpoints.

pub mod handlers;
pub mod routes;

pub use handlers::ApiState;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full application router.
pub fn create_app(state: ApiState) -> Router {
    routes::api_routes(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
