//! Anomaly detection over aggregated flow metrics
//!
//! Runs once per aggregation tick. For every active edge whose metrics were
//! refreshed by a record since the previous tick it evaluates the
//! ordered edge rules against the metric baselines as they stood before the
//! tick, then folds the tick's values into those baselines. Rules bound to a
//! baseline that is still warming up stay silent. Port scans are judged per
//! source from the aggregator's port activity and need no baseline.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::baseline::{Baseline, MetricKind, DEFAULT_BASELINE_WINDOW, MIN_SAMPLES_FOR_DETECTION};
use super::event::{AnomalyEvent, AnomalyKind, AnomalyLog, DEFAULT_MAX_EVENTS};
use super::rules::{
    DataExfiltrationRule, EdgeObservation, EdgeRule, Finding, HighErrorRateRule, PortScanRule,
    TrafficSpikeRule,
};
use crate::flow::FlowAggregator;
use crate::models::{Edge, FlowMetrics};
use crate::observability::AgentMetrics;

/// Detector thresholds and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples a baseline needs before its rules may fire
    pub min_samples: usize,
    /// Samples kept per baseline
    pub baseline_window: usize,
    /// Multiple of the baseline mean that counts as a spike
    pub spike_threshold: f64,
    /// Error fraction above which an edge is anomalous
    pub error_rate_threshold: f64,
    /// Distinct destination ports per source within the window
    pub port_scan_threshold: usize,
    /// Egress bytes per second treated as exfiltration
    pub exfil_threshold: f64,
    /// Consecutive ticks the egress rate must stay above `exfil_threshold`
    pub exfil_sustain_ticks: u32,
    /// Events retained in the anomaly log
    pub max_events: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: MIN_SAMPLES_FOR_DETECTION,
            baseline_window: DEFAULT_BASELINE_WINDOW,
            spike_threshold: 3.0,
            error_rate_threshold: 0.05,
            port_scan_threshold: 20,
            exfil_threshold: 10.0 * 1024.0 * 1024.0,
            exfil_sustain_ticks: 3,
            max_events: DEFAULT_MAX_EVENTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BaselineKey {
    edge_id: String,
    metric: MetricKind,
}

/// Flow anomaly detector
///
/// Owns its baselines privately; the event log is shared with consumers.
pub struct AnomalyDetector {
    aggregator: Arc<FlowAggregator>,
    config: DetectorConfig,
    rules: Vec<Box<dyn EdgeRule>>,
    port_scan: PortScanRule,
    /// Used only to track the egress streak
    exfil: DataExfiltrationRule,
    baselines: HashMap<BaselineKey, Baseline>,
    exfil_streaks: HashMap<String, u32>,
    /// `last_seen` of the metrics each edge was last evaluated with
    consumed: HashMap<String, DateTime<Utc>>,
    /// Sources already reported as scanning, with the report time
    reported_scans: HashMap<String, DateTime<Utc>>,
    log: Arc<AnomalyLog>,
    next_id: u64,
    metrics: AgentMetrics,
}

impl AnomalyDetector {
    /// Create a detector with the default rule set in evaluation order:
    /// traffic spike, high error rate, data exfiltration
    pub fn new(aggregator: Arc<FlowAggregator>, config: DetectorConfig) -> Self {
        let exfil = DataExfiltrationRule {
            threshold: config.exfil_threshold,
            sustain_ticks: config.exfil_sustain_ticks,
        };
        let rules: Vec<Box<dyn EdgeRule>> = vec![
            Box::new(TrafficSpikeRule {
                threshold: config.spike_threshold,
            }),
            Box::new(HighErrorRateRule {
                threshold: config.error_rate_threshold,
            }),
            Box::new(exfil.clone()),
        ];

        Self {
            aggregator,
            rules,
            port_scan: PortScanRule {
                threshold: config.port_scan_threshold,
            },
            exfil,
            baselines: HashMap::new(),
            exfil_streaks: HashMap::new(),
            consumed: HashMap::new(),
            reported_scans: HashMap::new(),
            log: Arc::new(AnomalyLog::new(config.max_events)),
            config,
            next_id: 1,
            metrics: AgentMetrics::new(),
        }
    }

    /// Append a rule after the built-in ones
    pub fn with_rule(mut self, rule: Box<dyn EdgeRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Shared handle to the anomaly event log
    pub fn log(&self) -> Arc<AnomalyLog> {
        Arc::clone(&self.log)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Baseline for an edge metric, if one has been started
    pub fn baseline(&self, edge_id: &str, metric: MetricKind) -> Option<&Baseline> {
        self.baselines.get(&BaselineKey {
            edge_id: edge_id.to_string(),
            metric,
        })
    }

    pub fn detect(&mut self) -> Vec<AnomalyEvent> {
        self.detect_at(Utc::now())
    }

    /// Run one detection tick; new events are appended to the log and returned
    pub fn detect_at(&mut self, now: DateTime<Utc>) -> Vec<AnomalyEvent> {
        let mut events = Vec::new();

        for edge in self.aggregator.active_flows() {
            if let Some(metrics) = edge.flow.as_ref() {
                self.evaluate_edge(&edge, metrics, now, &mut events);
            }
        }

        self.evaluate_port_scans(now, &mut events);
        self.prune(now);

        if !events.is_empty() {
            self.log.append(&events);
            for event in &events {
                self.metrics
                    .inc_anomalies_detected(event.kind.as_str(), event.severity.as_str());
            }
            debug!(count = events.len(), "Anomalies emitted");
        }
        events
    }

    fn evaluate_edge(
        &mut self,
        edge: &Edge,
        metrics: &FlowMetrics,
        now: DateTime<Utc>,
        events: &mut Vec<AnomalyEvent>,
    ) {
        // Metrics only change when a record arrives; a tick without one
        // carries no new observation and breaks the egress streak.
        let fresh = self
            .consumed
            .get(&edge.id)
            .map_or(true, |seen| metrics.last_seen > *seen);
        if !fresh {
            self.exfil_streaks.insert(edge.id.clone(), 0);
            return;
        }
        self.consumed.insert(edge.id.clone(), metrics.last_seen);

        let streak = {
            let streak = self.exfil_streaks.entry(edge.id.clone()).or_insert(0);
            *streak = if self.exfil.exceeds(metrics) {
                streak.saturating_add(1)
            } else {
                0
            };
            *streak
        };

        let window = self.config.baseline_window;
        for metric in [MetricKind::BytesPerSec, MetricKind::ErrorRate] {
            self.baselines
                .entry(BaselineKey {
                    edge_id: edge.id.clone(),
                    metric,
                })
                .or_insert_with(|| Baseline::new(window));
        }

        let mut findings: Vec<(AnomalyKind, Finding)> = Vec::new();
        for rule in &self.rules {
            let key = BaselineKey {
                edge_id: edge.id.clone(),
                metric: rule.metric(),
            };
            let Some(baseline) = self.baselines.get(&key) else {
                continue;
            };
            if !baseline.is_baselined(self.config.min_samples) {
                continue;
            }

            let obs = EdgeObservation {
                edge,
                metrics,
                baseline,
                exfil_streak: streak,
            };
            if let Some(finding) = rule.evaluate(&obs) {
                findings.push((rule.kind(), finding));
            }
        }

        for (kind, finding) in findings {
            let event = self.new_event(
                kind,
                finding,
                Some(edge.id.clone()),
                vec![edge.source.clone(), edge.target.clone()],
                now,
            );
            events.push(event);
        }

        for (metric, value) in [
            (MetricKind::BytesPerSec, metrics.bytes_per_sec),
            (MetricKind::ErrorRate, metrics.error_rate),
        ] {
            if let Some(baseline) = self.baselines.get_mut(&BaselineKey {
                edge_id: edge.id.clone(),
                metric,
            }) {
                baseline.add_sample(value);
            }
        }
    }

    fn evaluate_port_scans(&mut self, now: DateTime<Utc>, events: &mut Vec<AnomalyEvent>) {
        let window = self.aggregator.config().window();

        for activity in self.aggregator.distinct_ports_by_source(now) {
            let recently_reported = self
                .reported_scans
                .get(&activity.source)
                .map(|at| now - *at < window)
                .unwrap_or(false);
            if recently_reported {
                continue;
            }

            if let Some(finding) = self.port_scan.evaluate(&activity) {
                self.reported_scans.insert(activity.source.clone(), now);
                let event = self.new_event(
                    AnomalyKind::PortScan,
                    finding,
                    None,
                    vec![activity.source.clone()],
                    now,
                );
                events.push(event);
            }
        }
    }

    /// Drop state for edges that no longer exist and expired scan reports
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.aggregator.config().window();
        self.reported_scans.retain(|_, at| now - *at < window);

        let live = self.aggregator.store().edge_ids();
        self.baselines.retain(|key, _| live.contains(&key.edge_id));
        self.exfil_streaks.retain(|edge_id, _| live.contains(edge_id));
        self.consumed.retain(|edge_id, _| live.contains(edge_id));
    }

    fn new_event(
        &mut self,
        kind: AnomalyKind,
        finding: Finding,
        edge_id: Option<String>,
        node_ids: Vec<String>,
        now: DateTime<Utc>,
    ) -> AnomalyEvent {
        let id = self.next_id;
        self.next_id += 1;
        AnomalyEvent {
            id,
            kind,
            severity: finding.severity,
            edge_id,
            node_ids,
            description: finding.description,
            detected_at: now,
            values: finding.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::Severity;
    use crate::flow::AggregatorConfig;
    use crate::models::{FlowDirection, FlowRecord};
    use crate::topology::TopologyStore;
    use chrono::TimeZone;

    const MB: f64 = 1024.0 * 1024.0;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn setup() -> (Arc<FlowAggregator>, AnomalyDetector) {
        let store = Arc::new(TopologyStore::new());
        let aggregator = Arc::new(FlowAggregator::new(store, AggregatorConfig::default()));
        let detector = AnomalyDetector::new(Arc::clone(&aggregator), DetectorConfig::default());
        (aggregator, detector)
    }

    /// Set an edge's metrics directly, as the aggregator would after a record
    fn set_metrics(
        aggregator: &FlowAggregator,
        bytes_per_sec: f64,
        error_rate: f64,
        direction: FlowDirection,
        at: DateTime<Utc>,
    ) {
        aggregator
            .store()
            .apply_flow_metrics("pod/shop/web", "pod/shop/db", |_| FlowMetrics {
                bytes_per_sec,
                packets_per_sec: 10.0,
                active_connections: 1,
                error_rate,
                protocol: "tcp".to_string(),
                last_seen: at,
                is_active: true,
                direction,
            })
            .unwrap();
    }

    fn warm_up(aggregator: &FlowAggregator, detector: &mut AnomalyDetector, bytes: f64) {
        for tick in 0..10 {
            set_metrics(aggregator, bytes, 0.0, FlowDirection::Bidirectional, t(tick));
            assert!(detector.detect_at(t(tick)).is_empty());
        }
    }

    #[test]
    fn test_spike_fires_above_threshold() {
        let (aggregator, mut detector) = setup();
        warm_up(&aggregator, &mut detector, 100.0);

        set_metrics(&aggregator, 350.0, 0.0, FlowDirection::Bidirectional, t(10));
        let events = detector.detect_at(t(10));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::TrafficSpike);
        assert_eq!(events[0].edge_id.as_deref(), Some("pod/shop/web->pod/shop/db"));
        assert_eq!(events[0].values["baseline_mean"], 100.0);
    }

    #[test]
    fn test_no_spike_below_threshold() {
        let (aggregator, mut detector) = setup();
        warm_up(&aggregator, &mut detector, 100.0);

        set_metrics(&aggregator, 250.0, 0.0, FlowDirection::Bidirectional, t(10));
        assert!(detector.detect_at(t(10)).is_empty());
    }

    #[test]
    fn test_silent_during_warm_up() {
        let (aggregator, mut detector) = setup();
        for tick in 0..5 {
            set_metrics(&aggregator, 100.0, 0.0, FlowDirection::Bidirectional, t(tick));
            detector.detect_at(t(tick));
        }

        // every edge rule would fire on these values once baselined
        set_metrics(&aggregator, 50.0 * MB, 0.5, FlowDirection::Egress, t(5));
        assert!(detector.detect_at(t(5)).is_empty());
        assert!(detector.log().is_empty());
        assert_eq!(
            detector
                .baseline("pod/shop/web->pod/shop/db", MetricKind::BytesPerSec)
                .unwrap()
                .count(),
            6
        );
    }

    #[test]
    fn test_all_matching_rules_fire() {
        let (aggregator, mut detector) = setup();
        warm_up(&aggregator, &mut detector, 100.0);

        set_metrics(&aggregator, 1_000.0, 0.2, FlowDirection::Bidirectional, t(10));
        let events = detector.detect_at(t(10));
        let kinds: Vec<AnomalyKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AnomalyKind::TrafficSpike, AnomalyKind::HighErrorRate]);
        assert_eq!(events[0].severity, Severity::Critical);
        assert_eq!(events[1].severity, Severity::Critical);
        assert!(events[0].id < events[1].id);
        assert_eq!(detector.log().len(), 2);
    }

    #[test]
    fn test_sustained_egress_is_exfiltration() {
        let (aggregator, mut detector) = setup();
        for tick in 0..10 {
            set_metrics(&aggregator, 20.0 * MB, 0.0, FlowDirection::Egress, t(tick));
            assert!(detector.detect_at(t(tick)).is_empty());
        }

        set_metrics(&aggregator, 20.0 * MB, 0.0, FlowDirection::Egress, t(10));
        let events = detector.detect_at(t(10));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::DataExfiltration);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[test]
    fn test_single_burst_is_judged_once() {
        let (aggregator, mut detector) = setup();
        for tick in 0..10 {
            set_metrics(&aggregator, 10_000.0, 0.0, FlowDirection::Egress, t(tick));
            assert!(detector.detect_at(t(tick)).is_empty());
        }

        set_metrics(&aggregator, 500.0 * MB, 0.0, FlowDirection::Egress, t(100));
        let mut events = Vec::new();
        for tick in [100, 110, 120, 130] {
            events.extend(detector.detect_at(t(tick)));
        }

        let spikes = events
            .iter()
            .filter(|e| e.kind == AnomalyKind::TrafficSpike)
            .count();
        assert_eq!(spikes, 1);
        assert!(events
            .iter()
            .all(|e| e.kind != AnomalyKind::DataExfiltration));
        // stale ticks add no samples
        assert_eq!(
            detector
                .baseline("pod/shop/web->pod/shop/db", MetricKind::BytesPerSec)
                .unwrap()
                .count(),
            11
        );
    }

    #[test]
    fn test_gap_breaks_exfiltration_streak() {
        let (aggregator, mut detector) = setup();
        for tick in 0..10 {
            set_metrics(&aggregator, 20.0 * MB, 0.0, FlowDirection::Egress, t(tick));
            detector.detect_at(t(tick));
        }

        // a tick without a new record resets the streak
        assert!(detector.detect_at(t(10)).is_empty());
        for tick in 11..13 {
            set_metrics(&aggregator, 20.0 * MB, 0.0, FlowDirection::Egress, t(tick));
            assert!(detector.detect_at(t(tick)).is_empty());
        }
        set_metrics(&aggregator, 20.0 * MB, 0.0, FlowDirection::Egress, t(13));
        let events = detector.detect_at(t(13));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AnomalyKind::DataExfiltration);
    }

    #[test]
    fn test_port_scan_reported_once_per_window() {
        let (aggregator, mut detector) = setup();
        for port in 0..25u16 {
            aggregator
                .record_flow(FlowRecord {
                    source: "pod/shop/scanner".to_string(),
                    destination: "pod/shop/db".to_string(),
                    source_port: Some(51_000),
                    destination_port: Some(1_000 + port),
                    protocol: "tcp".to_string(),
                    bytes: 60,
                    packets: 1,
                    errors: 0,
                    timestamp: t(port as i64),
                    direction: None,
                })
                .unwrap();
        }

        let events = detector.detect_at(t(30));
        let scans: Vec<&AnomalyEvent> = events
            .iter()
            .filter(|e| e.kind == AnomalyKind::PortScan)
            .collect();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].node_ids, vec!["pod/shop/scanner".to_string()]);
        assert_eq!(scans[0].values["distinct_ports"], 25.0);

        // still inside the window: no duplicate report
        assert!(detector
            .detect_at(t(31))
            .iter()
            .all(|e| e.kind != AnomalyKind::PortScan));
    }

    #[test]
    fn test_reset_drops_baselines() {
        let (aggregator, mut detector) = setup();
        warm_up(&aggregator, &mut detector, 100.0);
        assert!(detector
            .baseline("pod/shop/web->pod/shop/db", MetricKind::BytesPerSec)
            .is_some());

        aggregator.store().reset();
        detector.detect_at(t(11));
        assert!(detector
            .baseline("pod/shop/web->pod/shop/db", MetricKind::BytesPerSec)
            .is_none());
    }
}
