//! Shipsight: Maritime AIOps — Anomaly & Incident Intelligence
//!
//! Event-driven pipeline for shipboard telemetry:
//!
//! - **Detector**: metric pull loop + anomalous-log subscriber, statistical
//!   detectors with historical baselines
//! - **Enricher**: two-stage contextual enrichment (identity, weather,
//!   operational status, enhancement analysis)
//! - **Correlator**: windowed many-to-one grouping into incidents
//! - **Incident Writer**: defensive field recovery + columnar persistence
//! - **Remediation Engine**: policy-guarded playbooks with approvals,
//!   dry-run, and rollback

pub mod api;
pub mod bus;
pub mod config;
pub mod correlator;
pub mod detector;
pub mod enricher;
pub mod error;
pub mod health;
pub mod incident_store;
pub mod metrics_store;
pub mod registry;
pub mod remediation;
pub mod review;
pub mod types;
pub mod writer;

// Re-export the event model
pub use types::{
    AnomalyEvent, CorrelationLevel, Domain, EnrichedAnomalyEvent, Incident, IncidentStatus,
    OperationalStatus, Severity,
};

// Re-export component entry points
pub use correlator::CorrelatorService;
pub use detector::DetectorService;
pub use enricher::EnricherService;
pub use remediation::RemediationEngine;
pub use writer::WriterService;

// Re-export client handles
pub use bus::BusGateway;
pub use incident_store::IncidentStoreClient;
pub use metrics_store::MetricsStoreClient;
pub use registry::DeviceRegistryClient;
