//! Cluster topology and traffic anomaly library
//!
//! This crate provides the core functionality for:
//! - A live graph of pods, services, nodes and the traffic between them
//! - Flow aggregation into per-edge rates and error ratios
//! - Baseline-driven anomaly detection
//! - Producer ingestion and periodic detection loops
//! - Health checks and observability

pub mod anomaly;
pub mod error;
pub mod flow;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod topology;

pub use anomaly::{
    AnomalyDetector, AnomalyEvent, AnomalyKind, AnomalyLog, DetectorConfig, Severity,
};
pub use error::ValidationError;
pub use flow::{AggregatorConfig, FlowAggregator};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
pub use topology::TopologyStore;
