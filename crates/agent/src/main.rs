//! Meshwatch Agent - cluster topology and traffic anomaly agent
//!
//! Keeps a live graph of cluster entities and the traffic between them,
//! fed through the ingest endpoint, and runs periodic anomaly detection
//! over the aggregated flows.

use meshwatch_lib::{
    anomaly::AnomalyDetector,
    flow::FlowAggregator,
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    pipeline::{ingest_channel, DetectionConfig, DetectionLoop, IngestionLoop},
    topology::TopologyStore,
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for events submitted through the HTTP ingest endpoint
const API_PRODUCER: &str = "api";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting meshwatch-agent");

    // Load configuration
    let config = config::AgentConfig::load()?;
    info!(
        cluster = %config.cluster_name,
        detection_interval_secs = config.detection_interval_secs,
        "Agent configured"
    );

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::INGESTION).await;
    health_registry.register(components::DETECTOR).await;
    health_registry.register(components::API).await;

    // Register metrics before the first scrape
    AgentMetrics::new();
    let logger = StructuredLogger::new(&config.cluster_name);
    logger.log_startup(AGENT_VERSION);

    // Core components
    let store = Arc::new(TopologyStore::new());
    let aggregator = Arc::new(FlowAggregator::new(store, config.aggregator.clone()));
    let detector = AnomalyDetector::new(Arc::clone(&aggregator), config.detector.clone());
    let anomalies = detector.log();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Ingestion
    let (ingest_tx, ingest_rx) = ingest_channel(config.ingest_channel_size);
    let ingestion = IngestionLoop::new(
        API_PRODUCER,
        Arc::clone(&aggregator),
        ingest_rx,
        logger.clone(),
    )
    .with_health(health_registry.clone());
    let ingestion_handle = tokio::spawn(ingestion.run(shutdown_tx.subscribe()));

    // Detection
    let detection = DetectionLoop::new(
        Arc::clone(&aggregator),
        detector,
        DetectionConfig {
            interval: config.detection_interval(),
            ..Default::default()
        },
        logger.clone(),
    )
    .with_health(health_registry.clone());
    let detection_handle = tokio::spawn(detection.run(shutdown_tx.subscribe()));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        Arc::clone(&aggregator),
        anomalies,
        ingest_tx,
        health_registry.clone(),
    ));

    // Mark agent as ready after initialization
    health_registry.set_ready(true).await;

    // Start API server; it stops with the other loops
    let mut api_shutdown = shutdown_tx.subscribe();
    let api_health = health_registry.clone();
    let api_port = config.api_port;
    let api_handle = tokio::spawn(async move {
        let result = api::serve(api_port, app_state, async move {
            let _ = api_shutdown.recv().await;
        })
        .await;
        if let Err(e) = &result {
            api_health.set_unhealthy(components::API, e.to_string()).await;
        }
        result
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;
    let _ = shutdown_tx.send(());

    match ingestion_handle.await {
        Ok(stats) => info!(
            applied = stats.applied,
            rejected = stats.rejected,
            "Ingestion stopped"
        ),
        Err(e) => error!(error = %e, "Ingestion task failed"),
    }
    if let Err(e) = detection_handle.await {
        error!(error = %e, "Detection task failed");
    }
    match api_handle.await {
        Ok(Err(e)) => error!(error = %e, "API server failed"),
        Err(e) => error!(error = %e, "API task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutting down");
    Ok(())
}
