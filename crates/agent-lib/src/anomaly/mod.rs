//! Anomaly detection for cluster traffic
//!
//! This module provides detection for:
//! - Traffic spikes (rate far above the edge's learned baseline)
//! - High error rates on an edge
//! - Port scans (one source touching many destination ports)
//! - Data exfiltration (sustained high egress)
//! - A bounded event log that consumers can filter by severity and type

mod baseline;
mod detector;
mod event;
mod rules;

pub use baseline::{
    Baseline, BaselineState, MetricKind, DEFAULT_BASELINE_WINDOW, MIN_SAMPLES_FOR_DETECTION,
};
pub use detector::{AnomalyDetector, DetectorConfig};
pub use event::{
    AnomalyEvent, AnomalyFilter, AnomalyKind, AnomalyLog, Severity, DEFAULT_MAX_EVENTS,
};
pub use rules::{
    DataExfiltrationRule, EdgeObservation, EdgeRule, Finding, HighErrorRateRule, PortScanRule,
    TrafficSpikeRule,
};
