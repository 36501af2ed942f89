//! Flow aggregation
//!
//! Folds flow records into per-edge `FlowMetrics`, keeps the bounded ring of
//! recent records and tracks per-source destination ports for scan detection.
//!
//! Rates are exponential moving averages: for a record arriving `dt` seconds
//! after the edge was last seen (clamped to at least one second), the
//! instantaneous rate is `bytes / dt` and the stored rate becomes
//! `alpha * instant + (1 - alpha) * previous`. A new or inactive edge starts
//! from the instantaneous value. Packet rate and error rate follow the same
//! rule, the error fraction of a record being `errors / packets`.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::ring::{FlowRingBuffer, RingStats, DEFAULT_RING_CAPACITY};
use crate::error::{require, ValidationError};
use crate::models::{Edge, EdgeKind, FlowDirection, FlowMetrics, FlowRecord, NodeKind};
use crate::observability::AgentMetrics;
use crate::topology::TopologyStore;

/// Default aggregation window (60 seconds)
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Default EMA weight given to the newest observation
const DEFAULT_RATE_SMOOTHING: f64 = 0.3;

/// Port observations kept per source within a window
const DEFAULT_MAX_PORT_OBSERVATIONS: usize = 4_096;

/// Longest accepted aggregation window (one week)
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for the flow aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Ring buffer capacity for recent flow records
    pub ring_capacity: usize,
    /// Aggregation window; flows not refreshed within it become inactive
    pub window_secs: u64,
    /// EMA weight of the newest observation, 0..=1
    pub rate_smoothing: f64,
    /// Cap on remembered (timestamp, port) pairs per source
    pub max_port_observations: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            window_secs: DEFAULT_WINDOW_SECS,
            rate_smoothing: DEFAULT_RATE_SMOOTHING,
            max_port_observations: DEFAULT_MAX_PORT_OBSERVATIONS,
        }
    }
}

impl AggregatorConfig {
    /// Aggregation window, capped at `MAX_WINDOW_SECS`
    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs.min(MAX_WINDOW_SECS) as i64)
    }

    /// Start of the window ending at `at`, saturating at the earliest
    /// representable instant
    fn window_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.checked_sub_signed(self.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Records counted for an edge in the current window bucket
#[derive(Debug, Clone, Copy)]
struct WindowBucket {
    started: DateTime<Utc>,
    records: u32,
}

/// Destination ports a single source has touched recently
#[derive(Debug, Default)]
struct PortActivity {
    observations: VecDeque<(DateTime<Utc>, u16)>,
}

impl PortActivity {
    fn observe(&mut self, at: DateTime<Utc>, port: u16, cutoff: DateTime<Utc>, cap: usize) {
        self.expire(cutoff);
        while self.observations.len() >= cap.max(1) {
            self.observations.pop_front();
        }
        self.observations.push_back((at, port));
    }

    fn expire(&mut self, cutoff: DateTime<Utc>) {
        self.observations.retain(|(at, _)| *at >= cutoff);
    }

    fn distinct_ports(&self) -> BTreeSet<u16> {
        self.observations.iter().map(|(_, port)| *port).collect()
    }

    fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Distinct destination ports a source reached within the window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePortActivity {
    pub source: String,
    pub distinct_ports: usize,
    /// Lowest and highest port seen
    pub port_range: (u16, u16),
}

/// Outcome of an inactivity sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub flows_deactivated: usize,
    pub sources_pruned: usize,
}

/// Folds flow records into the topology store
pub struct FlowAggregator {
    store: Arc<TopologyStore>,
    config: AggregatorConfig,
    recent: Mutex<FlowRingBuffer>,
    buckets: DashMap<String, WindowBucket>,
    ports: DashMap<String, PortActivity>,
    metrics: AgentMetrics,
}

impl FlowAggregator {
    pub fn new(store: Arc<TopologyStore>, config: AggregatorConfig) -> Self {
        Self {
            store,
            recent: Mutex::new(FlowRingBuffer::new(config.ring_capacity)),
            config,
            buckets: DashMap::new(),
            ports: DashMap::new(),
            metrics: AgentMetrics::new(),
        }
    }

    pub fn store(&self) -> &Arc<TopologyStore> {
        &self.store
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Fold a flow record into its edge's metrics and the recent ring
    ///
    /// Malformed records are rejected before anything is written.
    pub fn record_flow(&self, record: FlowRecord) -> Result<Edge, ValidationError> {
        if let Err(e) = validate_record(&record, self.config.window()) {
            warn!(error = %e, "Rejected flow record");
            self.metrics.inc_flows_rejected();
            return Err(e);
        }

        let direction = record
            .direction
            .unwrap_or_else(|| self.infer_direction(&record));
        let connections = self.count_in_window(&record);
        let alpha = self.config.rate_smoothing.clamp(0.0, 1.0);

        let edge = self
            .store
            .apply_flow_metrics(&record.source, &record.destination, |prior| {
                fold_metrics(prior, &record, direction, connections, alpha)
            })?;

        if let Some(port) = record.destination_port {
            let cutoff = self.config.window_start(record.timestamp);
            self.ports
                .entry(record.source.clone())
                .or_default()
                .observe(record.timestamp, port, cutoff, self.config.max_port_observations);
        }

        let buffered = {
            let mut ring = self.recent.lock();
            ring.push(record);
            ring.len()
        };

        self.metrics.inc_flows_ingested();
        self.metrics.set_flow_buffer_items(buffered as i64);
        debug!(edge_id = %edge.id, health = %edge.health, "Recorded flow");
        Ok(edge)
    }

    /// Drop every node and edge along with all flow history: the recent
    /// ring, window buckets and per-source port activity
    pub fn reset(&self) {
        self.recent.lock().clear();
        self.buckets.clear();
        self.ports.clear();
        self.store.reset();
        self.metrics.set_flow_buffer_items(0);
    }

    /// Edges with a flow observed within the current window
    pub fn active_flows(&self) -> Vec<Edge> {
        self.store.edges_where(|e| e.is_flow_active())
    }

    /// Up to `limit` most recent flow records, newest first
    pub fn recent_flows(&self, limit: usize) -> Vec<FlowRecord> {
        self.recent.lock().recent(limit)
    }

    pub fn buffer_stats(&self) -> RingStats {
        self.recent.lock().stats()
    }

    /// Sources with their distinct destination port count inside the window
    /// ending at `now`, sorted by source id
    pub fn distinct_ports_by_source(&self, now: DateTime<Utc>) -> Vec<SourcePortActivity> {
        let cutoff = self.config.window_start(now);
        let mut activity: Vec<SourcePortActivity> = self
            .ports
            .iter_mut()
            .filter_map(|mut entry| {
                entry.expire(cutoff);
                let ports = entry.distinct_ports();
                let low = *ports.iter().next()?;
                let high = *ports.iter().next_back()?;
                Some(SourcePortActivity {
                    source: entry.key().clone(),
                    distinct_ports: ports.len(),
                    port_range: (low, high),
                })
            })
            .collect();
        activity.sort_by(|a, b| a.source.cmp(&b.source));
        activity
    }

    /// Mark flows idle for longer than the window inactive and drop expired
    /// per-source and per-edge window state
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let window = self.config.window();
        let cutoff = self.config.window_start(now);

        let flows_deactivated = self.store.sweep_inactive(cutoff);

        let before = self.ports.len();
        self.ports.retain(|_, activity| {
            activity.expire(cutoff);
            !activity.is_empty()
        });
        let sources_pruned = before.saturating_sub(self.ports.len());

        self.buckets.retain(|_, bucket| now - bucket.started < window);

        if flows_deactivated > 0 {
            debug!(flows_deactivated, sources_pruned, "Inactivity sweep");
        }
        SweepReport {
            flows_deactivated,
            sources_pruned,
        }
    }

    /// Egress when traffic leaves for an external node, ingress when it
    /// arrives from one, bidirectional otherwise
    fn infer_direction(&self, record: &FlowRecord) -> FlowDirection {
        if self.store.node_kind(&record.destination) == Some(NodeKind::External) {
            FlowDirection::Egress
        } else if self.store.node_kind(&record.source) == Some(NodeKind::External) {
            FlowDirection::Ingress
        } else {
            FlowDirection::Bidirectional
        }
    }

    fn count_in_window(&self, record: &FlowRecord) -> u32 {
        let key = Edge::identity(&record.source, &record.destination, EdgeKind::Connection);
        let mut bucket = self.buckets.entry(key).or_insert(WindowBucket {
            started: record.timestamp,
            records: 0,
        });
        if record.timestamp - bucket.started >= self.config.window() {
            bucket.started = record.timestamp;
            bucket.records = 0;
        }
        bucket.records = bucket.records.saturating_add(1);
        bucket.records
    }
}

fn validate_record(record: &FlowRecord, window: Duration) -> Result<(), ValidationError> {
    require(&record.source, "flow", "source")?;
    require(&record.destination, "flow", "destination")?;
    if record.timestamp.checked_sub_signed(window).is_none() {
        return Err(ValidationError::InvalidValue {
            entity: "flow",
            field: "timestamp",
            reason: format!("{} is outside the supported time range", record.timestamp),
        });
    }
    if record.errors > record.packets {
        return Err(ValidationError::InvalidValue {
            entity: "flow",
            field: "errors",
            reason: format!(
                "{} errored packets out of {} packets",
                record.errors, record.packets
            ),
        });
    }
    Ok(())
}

fn ema(alpha: f64, current: f64, previous: f64) -> f64 {
    alpha * current + (1.0 - alpha) * previous
}

/// Build the replacement metrics for an edge from its previous metrics and
/// a new record
fn fold_metrics(
    prior: Option<&FlowMetrics>,
    record: &FlowRecord,
    direction: FlowDirection,
    connections: u32,
    alpha: f64,
) -> FlowMetrics {
    let error_fraction = if record.packets == 0 {
        0.0
    } else {
        record.errors as f64 / record.packets as f64
    };

    let active_prior = prior.filter(|p| p.is_active);
    let (bytes_per_sec, packets_per_sec, error_rate) = match active_prior {
        Some(p) => {
            let elapsed = ((record.timestamp - p.last_seen).num_milliseconds() as f64 / 1000.0)
                .max(1.0);
            (
                ema(alpha, record.bytes as f64 / elapsed, p.bytes_per_sec),
                ema(alpha, record.packets as f64 / elapsed, p.packets_per_sec),
                ema(alpha, error_fraction, p.error_rate),
            )
        }
        None => (record.bytes as f64, record.packets as f64, error_fraction),
    };

    let protocol = if record.protocol.is_empty() {
        prior
            .map(|p| p.protocol.clone())
            .unwrap_or_else(|| "unknown".to_string())
    } else {
        record.protocol.clone()
    };

    let last_seen = match active_prior {
        Some(p) if p.last_seen > record.timestamp => p.last_seen,
        _ => record.timestamp,
    };

    FlowMetrics {
        bytes_per_sec,
        packets_per_sec,
        active_connections: connections,
        error_rate: error_rate.clamp(0.0, 1.0),
        protocol,
        last_seen,
        is_active: true,
        direction,
    }
}
