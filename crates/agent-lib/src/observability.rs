//! Observability infrastructure for the topology agent
//!
//! Provides:
//! - Prometheus metrics (ingestion counters, buffer and topology gauges,
//!   anomaly counts, detection latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::anomaly::{AnomalyEvent, Severity};

/// Histogram buckets for detection tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    detection_latency_seconds: Histogram,
    flows_ingested: IntCounter,
    flows_rejected: IntCounter,
    ingest_dropped: IntCounter,
    flow_buffer_items: IntGauge,
    topology_nodes: IntGauge,
    topology_edges: IntGauge,
    active_flows: IntGauge,
    anomalies_detected: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            detection_latency_seconds: register_histogram!(
                "meshwatch_detection_latency_seconds",
                "Time spent in one sweep and anomaly detection tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register detection_latency_seconds"),

            flows_ingested: register_int_counter!(
                "meshwatch_flows_ingested_total",
                "Flow records folded into edge metrics"
            )
            .expect("Failed to register flows_ingested"),

            flows_rejected: register_int_counter!(
                "meshwatch_flows_rejected_total",
                "Flow records rejected by validation"
            )
            .expect("Failed to register flows_rejected"),

            ingest_dropped: register_int_counter!(
                "meshwatch_ingest_dropped_total",
                "Ingest events dropped because the ingest channel was full"
            )
            .expect("Failed to register ingest_dropped"),

            flow_buffer_items: register_int_gauge!(
                "meshwatch_flow_buffer_items",
                "Flow records held in the recent-flows ring buffer"
            )
            .expect("Failed to register flow_buffer_items"),

            topology_nodes: register_int_gauge!(
                "meshwatch_topology_nodes",
                "Nodes currently in the topology store"
            )
            .expect("Failed to register topology_nodes"),

            topology_edges: register_int_gauge!(
                "meshwatch_topology_edges",
                "Edges currently in the topology store"
            )
            .expect("Failed to register topology_edges"),

            active_flows: register_int_gauge!(
                "meshwatch_active_flows",
                "Edges with a flow observed within the aggregation window"
            )
            .expect("Failed to register active_flows"),

            anomalies_detected: register_int_counter_vec!(
                "meshwatch_anomalies_detected_total",
                "Anomaly events emitted by the detector",
                &["type", "severity"]
            )
            .expect("Failed to register anomalies_detected"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// Lightweight handle to the process-wide metrics; clones share them.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (registers global metrics on first call)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_detection_latency(&self, duration_secs: f64) {
        self.inner().detection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_flows_ingested(&self) {
        self.inner().flows_ingested.inc();
    }

    pub fn inc_flows_rejected(&self) {
        self.inner().flows_rejected.inc();
    }

    pub fn inc_ingest_dropped(&self) {
        self.inner().ingest_dropped.inc();
    }

    pub fn set_flow_buffer_items(&self, items: i64) {
        self.inner().flow_buffer_items.set(items);
    }

    pub fn set_topology_size(&self, nodes: i64, edges: i64) {
        self.inner().topology_nodes.set(nodes);
        self.inner().topology_edges.set(edges);
    }

    pub fn set_active_flows(&self, count: i64) {
        self.inner().active_flows.set(count);
    }

    pub fn inc_anomalies_detected(&self, kind: &str, severity: &str) {
        self.inner()
            .anomalies_detected
            .with_label_values(&[kind, severity])
            .inc();
    }
}

/// Structured logger for agent events
///
/// Emits event-shaped records so anomalies, rejected input and lifecycle
/// changes can be picked out of the JSON log stream.
#[derive(Clone)]
pub struct StructuredLogger {
    cluster: String,
}

impl StructuredLogger {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
        }
    }

    /// Log an emitted anomaly; high and critical ones at warn level
    pub fn log_anomaly(&self, event: &AnomalyEvent) {
        let edge = event.edge_id.as_deref().unwrap_or("-");
        if event.severity >= Severity::High {
            warn!(
                event = "anomaly_detected",
                cluster = %self.cluster,
                anomaly_id = event.id,
                anomaly_type = %event.kind,
                severity = %event.severity,
                edge_id = %edge,
                nodes = ?event.node_ids,
                details = %event.description,
                "Anomaly detected"
            );
        } else {
            info!(
                event = "anomaly_detected",
                cluster = %self.cluster,
                anomaly_id = event.id,
                anomaly_type = %event.kind,
                severity = %event.severity,
                edge_id = %edge,
                nodes = ?event.node_ids,
                details = %event.description,
                "Anomaly detected"
            );
        }
    }

    /// Log input rejected at the boundary
    pub fn log_rejected_input(&self, producer: &str, entity: &str, reason: &str) {
        warn!(
            event = "input_rejected",
            cluster = %self.cluster,
            producer = %producer,
            entity = %entity,
            reason = %reason,
            "Rejected malformed input"
        );
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            cluster = %self.cluster,
            agent_version = %version,
            "Topology agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            cluster = %self.cluster,
            reason = %reason,
            "Topology agent shutting down"
        );
    }
}
