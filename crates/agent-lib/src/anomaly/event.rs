//! Anomaly events and the bounded event log

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default number of events kept in the log
pub const DEFAULT_MAX_EVENTS: usize = 1_000;

/// Anomaly classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    TrafficSpike,
    HighErrorRate,
    PortScan,
    DataExfiltration,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::TrafficSpike => "traffic_spike",
            AnomalyKind::HighErrorRate => "high_error_rate",
            AnomalyKind::PortScan => "port_scan",
            AnomalyKind::DataExfiltration => "data_exfiltration",
        }
    }
}

impl std::fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnomalyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "traffic_spike" => Ok(AnomalyKind::TrafficSpike),
            "high_error_rate" => Ok(AnomalyKind::HighErrorRate),
            "port_scan" => Ok(AnomalyKind::PortScan),
            "data_exfiltration" => Ok(AnomalyKind::DataExfiltration),
            other => Err(format!("unknown anomaly type: {}", other)),
        }
    }
}

/// Anomaly severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity for an observed/threshold ratio; never decreases as the
    /// ratio grows
    pub fn from_exceedance(ratio: f64) -> Self {
        if ratio >= 3.0 {
            Severity::Critical
        } else if ratio >= 2.0 {
            Severity::High
        } else if ratio >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

/// A detected anomaly; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: AnomalyKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub node_ids: Vec<String>,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    /// Metric values that triggered the event
    pub values: BTreeMap<String, f64>,
}

/// Consumer-side query over the event log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalyFilter {
    /// Only events at or above this severity
    pub min_severity: Option<Severity>,
    pub kind: Option<AnomalyKind>,
    /// Newest `limit` matches
    pub limit: Option<usize>,
}

impl AnomalyFilter {
    fn matches(&self, event: &AnomalyEvent) -> bool {
        self.min_severity.map_or(true, |min| event.severity >= min)
            && self.kind.map_or(true, |kind| event.kind == kind)
    }
}

/// Bounded, shareable log of emitted anomalies (oldest dropped on overflow)
#[derive(Debug)]
pub struct AnomalyLog {
    events: RwLock<VecDeque<AnomalyEvent>>,
    capacity: usize,
}

impl AnomalyLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_MAX_EVENTS))),
            capacity,
        }
    }

    pub fn append(&self, new_events: &[AnomalyEvent]) {
        let mut events = self.events.write();
        for event in new_events {
            while events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
    }

    /// Matching events, newest first
    pub fn filter(&self, filter: &AnomalyFilter) -> Vec<AnomalyEvent> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.events
            .read()
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn by_severity(&self, min_severity: Severity) -> Vec<AnomalyEvent> {
        self.filter(&AnomalyFilter {
            min_severity: Some(min_severity),
            ..Default::default()
        })
    }

    pub fn by_kind(&self, kind: AnomalyKind) -> Vec<AnomalyEvent> {
        self.filter(&AnomalyFilter {
            kind: Some(kind),
            ..Default::default()
        })
    }

    pub fn recent(&self, limit: usize) -> Vec<AnomalyEvent> {
        self.filter(&AnomalyFilter {
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AnomalyLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}
