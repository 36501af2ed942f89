//! HTTP API for health checks, Prometheus metrics and topology read-out

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use meshwatch_lib::{
    anomaly::{AnomalyFilter, AnomalyKind, AnomalyLog, Severity},
    flow::FlowAggregator,
    health::{ComponentStatus, HealthRegistry},
    pipeline::{IngestEvent, IngestSender},
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// Default number of flow records returned by `/api/v1/flows/recent`
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<FlowAggregator>,
    pub anomalies: Arc<AnomalyLog>,
    pub ingest: IngestSender,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(
        aggregator: Arc<FlowAggregator>,
        anomalies: Arc<AnomalyLog>,
        ingest: IngestSender,
        health_registry: HealthRegistry,
    ) -> Self {
        Self {
            aggregator,
            anomalies,
            ingest,
            health_registry,
        }
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn topology(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.store().snapshot())
}

async fn active_flows(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregator.active_flows())
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_flows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    Json(state.aggregator.recent_flows(limit))
}

#[derive(Debug, Deserialize)]
struct AnomalyQuery {
    severity: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

impl AnomalyQuery {
    fn into_filter(self) -> Result<AnomalyFilter, String> {
        let min_severity = self
            .severity
            .as_deref()
            .map(str::parse::<Severity>)
            .transpose()?;
        let kind = self
            .kind
            .as_deref()
            .map(str::parse::<AnomalyKind>)
            .transpose()?;
        Ok(AnomalyFilter {
            min_severity,
            kind,
            limit: self.limit,
        })
    }
}

/// Anomaly events, newest first, optionally filtered by minimum severity
/// and type
async fn anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> Response {
    match query.into_filter() {
        Ok(filter) => Json(state.anomalies.filter(&filter)).into_response(),
        Err(message) => bad_request(message),
    }
}

/// Hand an event to the ingestion loop; 503 when its queue is full
async fn ingest(State(state): State<Arc<AppState>>, Json(event): Json<IngestEvent>) -> Response {
    if state.ingest.submit(event) {
        StatusCode::ACCEPTED.into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "ingest queue full" })),
        )
            .into_response()
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/topology", get(topology))
        .route("/api/v1/flows/active", get(active_flows))
        .route("/api/v1/flows/recent", get(recent_flows))
        .route("/api/v1/anomalies", get(anomalies))
        .route("/api/v1/ingest", post(ingest))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
