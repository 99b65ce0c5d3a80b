//! Shipsight — Maritime AIOps Anomaly & Incident Intelligence
//!
//! Single binary hosting every pipeline component as supervised tokio tasks:
//! detector, enricher, correlator, incident writer, remediation engine, and
//! the HTTP API.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (expects nats/clickhouse/victoria-metrics endpoints)
//! cargo run --release
//!
//! # Run with an explicit config file
//! SHIPSIGHT_CONFIG=/etc/shipsight.toml cargo run --release
//! ```
//!
//! # Environment Variables
//!
//! - `SHIPSIGHT_CONFIG`: path to the TOML configuration
//! - `RUST_LOG`: logging filter (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use shipsight::api::{create_app, ApiState};
use shipsight::config::{self, Settings};
use shipsight::health::HealthRegistry;
use shipsight::types::OperationalSnapshot;
use shipsight::{
    BusGateway, CorrelatorService, DetectorService, DeviceRegistryClient, EnricherService,
    IncidentStoreClient, MetricsStoreClient, RemediationEngine, WriterService,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "shipsight")]
#[command(about = "Shipsight Maritime AIOps Pipeline")]
#[command(version)]
struct CliArgs {
    /// Override the API bind address (default from config: "0.0.0.0:8080")
    #[arg(short, long)]
    addr: Option<String>,

    /// Path to the TOML configuration file
    #[arg(long, env = "SHIPSIGHT_CONFIG")]
    config: Option<String>,

    /// Emit logs as JSON (for the shipboard log router)
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(args.json_logs);

    let settings = match args.config {
        Some(ref path) => Settings::load_from(path),
        None => Settings::load(),
    };
    config::init(settings);
    let settings = config::get();

    info!("Starting Shipsight Maritime AIOps pipeline");
    info!(
        nats = %settings.endpoints.nats_url,
        metrics_store = %settings.endpoints.metrics_store_url,
        clickhouse = %settings.endpoints.clickhouse_url,
        "External endpoints"
    );

    // ── Shared clients ────────────────────────────────────────────────
    let bus = BusGateway::connect(&settings.endpoints.nats_url)
        .await
        .context("Initial bus connection failed")?;

    let clickhouse = IncidentStoreClient::client_from_settings(settings);
    let store = IncidentStoreClient::new(clickhouse.clone());
    if let Err(e) = store.migrate().await {
        // Storage reads/writes will degrade until the store is reachable;
        // the writer's health reflects that.
        warn!(error = %e, "Incident store migration failed at startup");
    }

    let metrics = Arc::new(MetricsStoreClient::new(
        &settings.endpoints.metrics_store_url,
        clickhouse,
    ));
    let registry = Arc::new(DeviceRegistryClient::from_settings(settings));

    // Enricher → detector/remediation feedback channel
    let (ops_tx, ops_rx) = watch::channel(OperationalSnapshot::default());

    // ── Components ────────────────────────────────────────────────────
    let mut health = HealthRegistry::default();
    let detector = Arc::new(DetectorService::new(
        bus.clone(),
        metrics.clone(),
        registry.clone(),
        ops_rx.clone(),
        health.register("detector"),
    ));
    let enricher = Arc::new(EnricherService::new(
        bus.clone(),
        registry.clone(),
        metrics.clone(),
        ops_tx,
        health.register("enricher"),
    ));
    let correlator = Arc::new(CorrelatorService::new(
        bus.clone(),
        health.register("correlator"),
    ));
    let writer = Arc::new(WriterService::new(
        bus.clone(),
        store.clone(),
        registry.clone(),
        health.register("incident_writer"),
    ));
    let remediation = Arc::new(RemediationEngine::new(
        bus.clone(),
        ops_rx,
        health.register("remediation"),
    ));

    let cancel = CancellationToken::new();
    let mut components = JoinSet::new();
    components.spawn(detector.run(cancel.clone()));
    components.spawn(enricher.run(cancel.clone()));
    components.spawn(correlator.run(cancel.clone()));
    components.spawn(writer.clone().run(cancel.clone()));
    components.spawn(remediation.clone().run(cancel.clone()));

    // ── HTTP API ──────────────────────────────────────────────────────
    let state = ApiState {
        health,
        store,
        writer,
        remediation,
    };
    let app = create_app(state);
    let bind_addr = args
        .addr
        .unwrap_or_else(|| settings.server.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind API listener on {bind_addr}"))?;
    info!(addr = %bind_addr, "API listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        let shutdown = server_cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server exited with error");
        }
    });

    // ── Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received — draining in-flight work");
    cancel.cancel();

    let grace = Duration::from_secs(settings.shutdown.grace_seconds);
    let drain = async {
        while components.join_next().await.is_some() {}
        let _ = server.await;
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "Grace period elapsed — hard stop");
    }

    info!("Shipsight stopped");
    Ok(())
}
